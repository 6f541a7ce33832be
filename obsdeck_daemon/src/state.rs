//! Mirrored remote state. Owned and mutated only by the session engine.

/// A scene or transition with its 1-based rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ranked {
    pub ordinal: u32,
    pub name: String,
}

/// Names in display order; the ordinal is the position plus one.
///
/// Renames keep ordinals. Inserts and removals rebuild them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrdinalMap {
    names: Vec<String>,
}

impl OrdinalMap {
    pub fn from_names(names: impl IntoIterator<Item = String>) -> Self {
        let mut map = Self::default();
        map.replace(names.into_iter().collect());
        map
    }

    pub fn replace(&mut self, names: Vec<String>) {
        self.names.clear();
        for name in names {
            if !self.names.contains(&name) {
                self.names.push(name);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ordinal(name).is_some()
    }

    pub fn name(&self, ordinal: u32) -> Option<&str> {
        let idx = (ordinal as usize).checked_sub(1)?;
        self.names.get(idx).map(String::as_str)
    }

    pub fn ordinal(&self, name: &str) -> Option<u32> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| idx as u32 + 1)
    }

    pub fn get(&self, ordinal: u32) -> Option<Ranked> {
        self.name(ordinal).map(|name| Ranked {
            ordinal,
            name: name.to_string(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Ranked> + '_ {
        self.names.iter().enumerate().map(|(idx, name)| Ranked {
            ordinal: idx as u32 + 1,
            name: name.clone(),
        })
    }

    /// Appends a name as the last ordinal. Returns its ordinal.
    pub fn push(&mut self, name: String) -> u32 {
        if let Some(ordinal) = self.ordinal(&name) {
            return ordinal;
        }
        self.names.push(name);
        self.names.len() as u32
    }

    /// Removes a name; every later entry moves down by one.
    pub fn remove(&mut self, name: &str) -> Option<u32> {
        let idx = self.names.iter().position(|n| n == name)?;
        self.names.remove(idx);
        Some(idx as u32 + 1)
    }

    pub fn rename(&mut self, old: &str, new: &str) -> Option<u32> {
        let idx = self.names.iter().position(|n| n == old)?;
        self.names[idx] = new.to_string();
        Some(idx as u32 + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub item_id: i64,
    pub uuid: String,
    pub name: String,
    pub enabled: bool,
    /// Remote compositing index; 0 is the bottom layer.
    pub index: u32,
}

/// Scene items of one scene, top layer first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceList {
    scene: String,
    items: Vec<Source>,
}

impl SourceList {
    pub fn scene(&self) -> &str {
        &self.scene
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.scene.clear();
        self.items.clear();
    }

    pub fn replace(&mut self, scene: String, mut items: Vec<Source>) {
        items.sort_by(|a, b| b.index.cmp(&a.index));
        self.scene = scene;
        self.items = items;
    }

    pub fn rename_scene(&mut self, old: &str, new: &str) {
        if self.scene == old {
            self.scene = new.to_string();
        }
    }

    pub fn get(&self, ordinal: u32) -> Option<&Source> {
        let idx = (ordinal as usize).checked_sub(1)?;
        self.items.get(idx)
    }

    fn position(&self, item_id: i64) -> Option<usize> {
        self.items.iter().position(|s| s.item_id == item_id)
    }

    pub fn insert(&mut self, source: Source) {
        if let Some(idx) = self.position(source.item_id) {
            self.items.remove(idx);
        }
        for item in &mut self.items {
            if item.index >= source.index {
                item.index += 1;
            }
        }
        let at = self
            .items
            .iter()
            .position(|s| s.index < source.index)
            .unwrap_or(self.items.len());
        self.items.insert(at, source);
    }

    pub fn remove(&mut self, item_id: i64) -> bool {
        let Some(idx) = self.position(item_id) else {
            return false;
        };
        let removed = self.items.remove(idx);
        for item in &mut self.items {
            if item.index > removed.index {
                item.index -= 1;
            }
        }
        true
    }

    /// Returns the ordinal of the changed entry.
    pub fn set_enabled(&mut self, item_id: i64, enabled: bool) -> Option<u32> {
        let idx = self.position(item_id)?;
        self.items[idx].enabled = enabled;
        Some(idx as u32 + 1)
    }

    /// Renames every item backed by the renamed input. Items are matched by
    /// source uuid when both sides carry one, by the old name otherwise.
    /// Returns the touched ordinals.
    pub fn rename(&mut self, uuid: &str, old: &str, new: &str) -> Vec<u32> {
        let mut touched = Vec::new();
        for (idx, item) in self.items.iter_mut().enumerate() {
            let hit = if uuid.is_empty() || item.uuid.is_empty() {
                item.name == old
            } else {
                item.uuid == uuid
            };
            if hit {
                item.name = new.to_string();
                touched.push(idx as u32 + 1);
            }
        }
        touched
    }

    /// Applies new compositing indices. Items not mentioned keep theirs.
    pub fn reorder(&mut self, order: &[(i64, u32)]) -> bool {
        let mut changed = false;
        for &(item_id, index) in order {
            if let Some(idx) = self.position(item_id) {
                if self.items[idx].index != index {
                    self.items[idx].index = index;
                    changed = true;
                }
            }
        }
        if changed {
            self.items.sort_by(|a, b| b.index.cmp(&a.index));
        }
        changed
    }
}

/// Fade-to-black snapshot and animation frame counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FadeToBlack {
    pub active: bool,
    pub frame: u64,
    pub saved_scene: String,
    pub saved_preview: String,
}

impl FadeToBlack {
    /// Index into an animation of `len` frames, running forward then backward.
    pub fn frame_index(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let cycle = (self.frame % (2 * len as u64)) as usize;
        if cycle < len {
            cycle
        } else {
            2 * len - 1 - cycle
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub connected: bool,
    pub program_scene: String,
    pub preview_scene: String,
    pub transition: String,
    pub transition_ms: u32,
    pub recording: bool,
    pub streaming: bool,
    pub virtualcam: bool,
    pub studio_mode: bool,
    pub scenes: OrdinalMap,
    pub transitions: OrdinalMap,
    pub sources: SourceList,
    pub ftb: FadeToBlack,
    /// Reserved scene used by fade-to-black.
    pub black_scene: String,
}

impl SessionState {
    pub fn new(black_scene: impl Into<String>) -> Self {
        Self {
            black_scene: black_scene.into(),
            ..Self::default()
        }
    }

    /// The scene whose sources are mirrored.
    pub fn relevant_scene(&self) -> &str {
        if self.studio_mode && !self.preview_scene.is_empty() {
            &self.preview_scene
        } else {
            &self.program_scene
        }
    }

    /// The scene live buttons show as active. While fade-to-black runs outside
    /// studio mode this is the scene that will be restored.
    pub fn live_scene(&self) -> &str {
        if self.ftb.active && !self.studio_mode {
            &self.ftb.saved_scene
        } else {
            &self.program_scene
        }
    }

    pub fn can_fade_to_black(&self) -> bool {
        !self.black_scene.is_empty() && self.scenes.contains(&self.black_scene)
    }

    /// Idle dimming must not kick in while an output is live.
    pub fn prohibit_sleep(&self) -> bool {
        self.recording || self.streaming
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn src(item_id: i64, name: &str, index: u32) -> Source {
        Source {
            item_id,
            uuid: String::new(),
            name: name.to_string(),
            enabled: true,
            index,
        }
    }

    #[test]
    fn delete_shifts_later_ordinals_down() {
        let mut scenes = OrdinalMap::from_names(["A", "B", "C"].map(String::from));
        assert_eq!(scenes.remove("B"), Some(2));
        assert_eq!(scenes.name(1), Some("A"));
        assert_eq!(scenes.name(2), Some("C"));
        assert_eq!(scenes.name(3), None);
        assert_eq!(scenes.ordinal("C"), Some(2));
    }

    #[test]
    fn rename_keeps_ordinal() {
        let mut scenes = OrdinalMap::from_names(["A", "B"].map(String::from));
        assert_eq!(scenes.rename("A", "Intro"), Some(1));
        assert_eq!(scenes.get(1).map(|s| s.name), Some("Intro".to_string()));
        assert!(!scenes.contains("A"));
    }

    #[test]
    fn ordinal_zero_is_never_valid() {
        let scenes = OrdinalMap::from_names(["A"].map(String::from));
        assert_eq!(scenes.name(0), None);
        assert_eq!(scenes.get(0), None);
    }

    #[test]
    fn sources_are_top_layer_first() {
        let mut list = SourceList::default();
        list.replace("S".into(), vec![src(1, "bg", 0), src(2, "cam", 2), src(3, "text", 1)]);
        let names: Vec<_> = list.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["cam", "text", "bg"]);
    }

    #[test]
    fn insert_and_remove_adjust_indices() {
        let mut list = SourceList::default();
        list.replace("S".into(), vec![src(1, "bg", 0), src(2, "cam", 1)]);

        list.insert(src(3, "logo", 1));
        let names: Vec<_> = list.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["cam", "logo", "bg"]);
        assert_eq!(list.get(1).map(|s| s.index), Some(2));

        assert!(list.remove(3));
        let names: Vec<_> = list.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["cam", "bg"]);
        assert_eq!(list.get(1).map(|s| s.index), Some(1));
        assert!(!list.remove(3));
    }

    #[test]
    fn visibility_and_rename_touch_only_their_fields() {
        let mut list = SourceList::default();
        list.replace("S".into(), vec![src(1, "bg", 0), src(2, "cam", 1)]);

        assert_eq!(list.set_enabled(1, false), Some(2));
        assert_eq!(list.rename("", "cam", "camera"), vec![1]);
        assert_eq!(list.get(1).map(|s| s.name.as_str()), Some("camera"));
        assert_eq!(list.get(2).map(|s| s.enabled), Some(false));
        assert_eq!(list.get(2).map(|s| s.item_id), Some(1));
    }

    #[test]
    fn rename_prefers_source_uuid() {
        let tagged = |item_id, uuid: &str, index| Source {
            uuid: uuid.to_string(),
            ..src(item_id, "cam", index)
        };
        let mut list = SourceList::default();
        list.replace("S".into(), vec![tagged(1, "u-1", 0), tagged(2, "u-2", 1)]);

        assert_eq!(list.rename("u-1", "cam", "camera"), vec![2]);
        assert_eq!(list.get(1).map(|s| s.name.as_str()), Some("cam"));
        assert_eq!(list.get(2).map(|s| s.name.as_str()), Some("camera"));
    }

    #[test]
    fn reorder_resorts() {
        let mut list = SourceList::default();
        list.replace("S".into(), vec![src(1, "bg", 0), src(2, "cam", 1)]);
        assert!(list.reorder(&[(1, 1), (2, 0)]));
        assert_eq!(list.get(1).map(|s| s.name.as_str()), Some("bg"));
        assert!(!list.reorder(&[(1, 1), (2, 0)]));
    }

    #[test]
    fn frame_index_ping_pongs() {
        let mut ftb = FadeToBlack::default();
        let seq: Vec<usize> = (0..8)
            .map(|f| {
                ftb.frame = f;
                ftb.frame_index(3)
            })
            .collect();
        assert_eq!(seq, [0, 1, 2, 2, 1, 0, 0, 1]);
    }

    proptest! {
        #[test]
        fn removal_keeps_ordinals_dense(
            names in prop::collection::hash_set("[a-z]{1,6}", 1..12),
            pick in any::<prop::sample::Index>(),
        ) {
            let names: Vec<String> = names.into_iter().collect();
            let mut map = OrdinalMap::from_names(names.clone());
            let victim = pick.get(&names).clone();
            let gone = map.remove(&victim).unwrap();

            prop_assert_eq!(map.len(), names.len() - 1);
            for (idx, name) in names.iter().enumerate() {
                let before = idx as u32 + 1;
                let expected = match before.cmp(&gone) {
                    std::cmp::Ordering::Less => Some(before),
                    std::cmp::Ordering::Equal => None,
                    std::cmp::Ordering::Greater => Some(before - 1),
                };
                prop_assert_eq!(map.ordinal(name), expected);
            }
        }

        #[test]
        fn rename_never_moves_anything(
            names in prop::collection::hash_set("[a-z]{1,6}", 1..12),
            pick in any::<prop::sample::Index>(),
        ) {
            let names: Vec<String> = names.into_iter().collect();
            let mut map = OrdinalMap::from_names(names.clone());
            let old = pick.get(&names).clone();
            let ordinal = map.ordinal(&old);

            prop_assert_eq!(map.rename(&old, "RENAMED"), ordinal);
            prop_assert_eq!(map.len(), names.len());
            for (idx, name) in names.iter().enumerate().filter(|(_, n)| **n != old) {
                prop_assert_eq!(map.ordinal(name), Some(idx as u32 + 1));
            }
        }
    }
}
