//! Fold tasks into session groups.
//!
//! Folding only merges *consecutive* items with equal keys, so the input is
//! stable-sorted by key first; ties keep their discovery order.

use crate::core::types::SessionKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group<T> {
    pub key: SessionKey,
    pub members: Vec<T>,
}

pub fn group_by_session<T, F>(mut items: Vec<T>, key: F) -> Vec<Group<T>>
where
    F: Fn(&T) -> SessionKey,
{
    items.sort_by_key(&key);
    fold_consecutive(items, key)
}

fn fold_consecutive<T, F>(items: Vec<T>, key: F) -> Vec<Group<T>>
where
    F: Fn(&T) -> SessionKey,
{
    let mut groups: Vec<Group<T>> = Vec::new();
    for item in items {
        let item_key = key(&item);
        match groups.last_mut() {
            Some(group) if group.key == item_key => group.members.push(item),
            _ => groups.push(Group {
                key: item_key,
                members: vec![item],
            }),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SessionClass;

    fn item(id: &str, kind: &str, class: SessionClass) -> (String, SessionKey) {
        (id.to_string(), SessionKey::new(kind, class))
    }

    fn ids(group: &Group<(String, SessionKey)>) -> Vec<&str> {
        group.members.iter().map(|(id, _)| id.as_str()).collect()
    }

    #[test]
    fn groups_interleaved_keys_once_each() {
        let items = vec![
            item("a/1", "ChimeraX", SessionClass::Raw),
            item("b/1", "Lean", SessionClass::Raw),
            item("a/2", "ChimeraX", SessionClass::Raw),
            item("a/3", "ChimeraX", SessionClass::Vm),
            item("b/2", "Lean", SessionClass::Raw),
        ];
        let groups = group_by_session(items, |(_, key)| key.clone());
        let keys: Vec<String> = groups.iter().map(|g| g.key.to_string()).collect();
        assert_eq!(keys, vec!["ChimeraX:Raw", "ChimeraX:VM", "Lean:Raw"]);
        assert_eq!(ids(&groups[0]), vec!["a/1", "a/2"]);
        assert_eq!(ids(&groups[1]), vec!["a/3"]);
        assert_eq!(ids(&groups[2]), vec!["b/1", "b/2"]);
    }

    #[test]
    fn unsorted_fold_would_split_groups() {
        let items = vec![
            item("1", "A", SessionClass::Raw),
            item("2", "B", SessionClass::Raw),
            item("3", "A", SessionClass::Raw),
        ];
        assert_eq!(fold_consecutive(items.clone(), |(_, k)| k.clone()).len(), 3);
        assert_eq!(group_by_session(items, |(_, k)| k.clone()).len(), 2);
    }

    #[test]
    fn empty_input_has_no_groups() {
        let groups = group_by_session(Vec::<(String, SessionKey)>::new(), |(_, k)| k.clone());
        assert!(groups.is_empty());
    }
}
