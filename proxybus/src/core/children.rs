//! The tree of child proxies.
//!
//! Each proxy keeps its direct children. Operations on a descendant walk the
//! path one segment at a time, locking one proxy at a time. Adding a deep
//! child creates placeholder proxies for missing intermediate segments.

use crate::Result;
use crate::api::models::BusError;
use crate::api::proxy_object::ProxyBusObject;
use crate::util::utils::{join_segment, relative_segments, resolve_child_path};

fn find_child(parent: &ProxyBusObject, path: &str) -> Option<ProxyBusObject> {
    parent
        .internal
        .lock()
        .children
        .iter()
        .find(|c| c.path() == path)
        .cloned()
}

pub(crate) fn get_child(root: &ProxyBusObject, path: &str) -> Option<ProxyBusObject> {
    let target = resolve_child_path(root.path(), path)?;
    let mut current = root.clone();
    for segment in relative_segments(root.path(), &target) {
        let item = join_segment(current.path(), segment);
        current = find_child(&current, &item)?;
    }
    Some(current)
}

pub(crate) fn add_child(root: &ProxyBusObject, child: ProxyBusObject) -> Result<()> {
    let target = resolve_child_path(root.path(), child.path())
        .filter(|resolved| resolved == child.path())
        .ok_or_else(|| BusError::BadChildPath(child.path().to_string()))?;

    let segments = relative_segments(root.path(), &target);
    let last = segments.len() - 1;
    let mut current = root.clone();
    for (index, segment) in segments.into_iter().enumerate() {
        let item = join_segment(current.path(), segment);
        let (unique_name, secure) = {
            let state = current.internal.lock();
            (state.unique_name.clone(), state.secure)
        };
        let next = {
            let mut state = current.internal.lock();
            let existing = state.children.iter().find(|c| c.path() == item).cloned();
            match existing {
                Some(_) if index == last => return Err(BusError::ObjectAlreadyExists(item)),
                Some(existing) => existing,
                None if index == last => {
                    state.children.push(child);
                    return Ok(());
                }
                None => {
                    let placeholder = current.placeholder(&item, unique_name, secure);
                    state.children.push(placeholder.clone());
                    placeholder
                }
            }
        };
        current = next;
    }
    Ok(())
}

pub(crate) fn remove_child(root: &ProxyBusObject, path: &str) -> Result<()> {
    let target = resolve_child_path(root.path(), path)
        .ok_or_else(|| BusError::BadChildPath(path.to_string()))?;

    let segments = relative_segments(root.path(), &target);
    let last = segments.len() - 1;
    let mut current = root.clone();
    for (index, segment) in segments.into_iter().enumerate() {
        let item = join_segment(current.path(), segment);
        let next = {
            let mut state = current.internal.lock();
            let position = state
                .children
                .iter()
                .position(|c| c.path() == item)
                .ok_or_else(|| BusError::ObjectNotFound(item.clone()))?;
            if index == last {
                state.children.remove(position);
                return Ok(());
            }
            state.children[position].clone()
        };
        current = next;
    }
    Ok(())
}
