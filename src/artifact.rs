//! Deterministic artifact naming and the fact keys that describe them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoStaticStr};

/// Characters that never make it into a file name.
const PATH_HOSTILE: &str = r#"●.=^;-~{}<>/\*+:&?|%#$'"@!"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, EnumIter)]
pub enum ArtifactKind {
    #[strum(serialize = ".mp4")]
    Video,
    #[strum(serialize = ".jpg")]
    Image,
    #[strum(serialize = ".mp3")]
    Audio,
    #[strum(serialize = ".json")]
    Log,
}

impl ArtifactKind {
    pub fn extension(self) -> &'static str {
        self.into()
    }

    /// Images are always small enough to deliver whole.
    pub fn splittable(self) -> bool {
        matches!(self, Self::Video | Self::Audio)
    }
}

/// Replace every path-hostile character with `_`.
pub fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| if PATH_HOSTILE.contains(c) { '_' } else { c })
        .collect()
}

/// One entry of a playlist or a single lookup, as the catalog describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub thumbnail_url: String,
    pub media_url: String,
}

/// A catalog item after normalisation, bound to a session directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: String,
    pub artist: String,
    pub title: String,
    pub thumbnail_url: String,
    pub media_url: String,
    base: PathBuf,
}

impl Item {
    pub fn new(descriptor: ItemDescriptor, session_dir: &Path) -> Self {
        let artist = sanitize(descriptor.artist.replace(" - Topic", "").trim());
        let title = sanitize(descriptor.title.trim());
        let id = sanitize(descriptor.id.trim());
        let base = session_dir.join(format!("{artist}__{title}__{id}"));
        Self {
            id,
            artist,
            title,
            thumbnail_url: descriptor.thumbnail_url,
            media_url: descriptor.media_url,
            base,
        }
    }

    pub fn path(&self, kind: ArtifactKind) -> PathBuf {
        with_suffix(&self.base, kind.extension())
    }

    /// Printf-style pattern handed to the segmenter, `{base}__%04d{ext}`.
    pub fn segment_pattern(&self, kind: ArtifactKind) -> PathBuf {
        with_suffix(&self.base, &format!("__%04d{}", kind.extension()))
    }

    /// Prefix shared by every segment file name.
    pub fn segment_prefix(&self) -> String {
        let name = self
            .base
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{name}__")
    }

    pub fn caption(&self) -> String {
        format!("{} [{}]", self.artist, self.title)
    }

    pub fn same_as(&self, other: &Item) -> bool {
        self.artist == other.artist && self.title == other.title && self.id == other.id
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut os = base.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// Fact keys published on the session branch.
pub mod facts {
    use std::path::Path;

    /// `bool`: the artifact at `path` exists and is usable.
    pub fn ready(path: &Path) -> String {
        format!("ready:{}", path.display())
    }

    /// `bool`: whoever produces `path` has finished, successfully or not.
    pub fn done(path: &Path) -> String {
        format!("done:{}", path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ItemDescriptor {
        ItemDescriptor {
            id: "tO-vtgZxPl0".into(),
            title: "Coral / LiQWYD (No Copyright Music)".into(),
            artist: "Audio Library - Topic".into(),
            thumbnail_url: "http://img/1.jpg".into(),
            media_url: "http://media/1".into(),
        }
    }

    #[test]
    fn sanitize_replaces_hostile_characters() {
        assert_eq!(sanitize("a/b:c?d e"), "a_b_c_d e");
        assert_eq!(sanitize("plain"), "plain");
    }

    #[test]
    fn item_paths_are_deterministic() {
        let item = Item::new(descriptor(), Path::new("sess"));
        assert_eq!(item.artist, "Audio Library");
        assert_eq!(
            item.path(ArtifactKind::Video),
            Path::new("sess/Audio Library__Coral _ LiQWYD (No Copyright Music)__tO_vtgZxPl0.mp4")
        );
        assert_eq!(
            item.segment_prefix(),
            "Audio Library__Coral _ LiQWYD (No Copyright Music)__tO_vtgZxPl0__"
        );
        assert!(item
            .segment_pattern(ArtifactKind::Video)
            .to_string_lossy()
            .ends_with("__%04d.mp4"));
    }

    #[test]
    fn kind_display_is_extension() {
        assert_eq!(ArtifactKind::Image.to_string(), ".jpg");
        assert_eq!(ArtifactKind::Log.extension(), ".json");
        assert!(!ArtifactKind::Image.splittable());
    }

    #[test]
    fn same_item_detection() {
        let a = Item::new(descriptor(), Path::new("s"));
        let mut d = descriptor();
        d.media_url = "http://elsewhere".into();
        assert!(a.same_as(&Item::new(d, Path::new("s"))));
    }
}
