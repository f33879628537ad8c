//! Input discovery: finding the lossless tracks of a batch and guessing
//! the batch's album identity for status reporting.

use crate::tags::{TagMap, TagStore};
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

fn has_extension(path: &Path, wanted: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(wanted))
        .unwrap_or(false)
}

/// Recursively collect every file under `root` with the given extension
/// (case-insensitive), skipping hidden files and directories. The result
/// is sorted so batches are processed in a stable order.
pub fn find_files_with_extension(root: &Path, extension: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.path()))
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| has_extension(path, extension))
        .collect();

    files.sort();
    files
}

/// All `.flac` files under `root`, sorted.
pub fn find_flac_files(root: &Path) -> Vec<PathBuf> {
    find_files_with_extension(root, "flac")
}

/// The artist and album a batch most likely belongs to, guessed from the
/// first track's tags. Artist preference: `albumartist`, then
/// `album artist`, then `artist`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlbumIdentity {
    pub artist: Option<String>,
    pub album: Option<String>,
}

fn first_value(tags: &TagMap, name: &str) -> Option<String> {
    tags.get(name)
        .and_then(|values| values.first())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn guess_album_identity(store: &dyn TagStore, tracks: &[PathBuf]) -> AlbumIdentity {
    let Some(first) = tracks.first() else {
        return AlbumIdentity::default();
    };

    let tags = match store.read_tags(first) {
        Ok(tags) => tags,
        Err(e) => {
            warn!("Failed to read tags from {}: {}", first.display(), e);
            return AlbumIdentity::default();
        }
    };

    let artist = first_value(&tags, "albumartist")
        .or_else(|| first_value(&tags, "album artist"))
        .or_else(|| first_value(&tags, "artist"));

    AlbumIdentity {
        artist,
        album: first_value(&tags, "album"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{AudioProperties, Artwork, TagError};
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::tempdir;

    struct MapTagStore {
        tags: BTreeMap<PathBuf, TagMap>,
    }

    impl TagStore for MapTagStore {
        fn read_tags(&self, path: &Path) -> Result<TagMap, TagError> {
            Ok(self.tags.get(path).cloned().unwrap_or_default())
        }

        fn audio_properties(&self, _path: &Path) -> Result<AudioProperties, TagError> {
            Ok(AudioProperties {
                bit_depth: 16,
                sample_rate: 44100,
            })
        }

        fn artwork(&self, _path: &Path) -> Result<Vec<Artwork>, TagError> {
            Ok(Vec::new())
        }

        fn write_tags(&self, _path: &Path, _tags: &TagMap) -> Result<(), TagError> {
            Ok(())
        }

        fn replace_all_tags(
            &self,
            _path: &Path,
            _tags: &TagMap,
            _artwork: &[Artwork],
        ) -> Result<(), TagError> {
            Ok(())
        }

        fn remove_tags(&self, _path: &Path, _names: &[&str]) -> Result<(), TagError> {
            Ok(())
        }
    }

    #[test]
    fn test_find_flac_files_filters_and_sorts() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.flac"), b"x").unwrap();
        fs::write(dir.path().join("a.FLAC"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::write(dir.path().join("c.wav"), b"x").unwrap();

        let found = find_flac_files(dir.path());
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.FLAC", "b.flac"]);
    }

    #[test]
    fn test_find_flac_files_recurses_and_skips_hidden() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("disc1");
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("track.flac"), b"x").unwrap();
        fs::write(dir.path().join(".hidden.flac"), b"x").unwrap();

        let found = find_flac_files(dir.path());
        assert_eq!(found, vec![sub.join("track.flac")]);
    }

    #[test]
    fn test_guess_album_identity_prefers_albumartist() {
        let track = PathBuf::from("/music/first.flac");
        let mut tags = TagMap::new();
        tags.insert("artist".to_string(), vec!["Track Artist".to_string()]);
        tags.insert("albumartist".to_string(), vec!["Album Artist".to_string()]);
        tags.insert("album".to_string(), vec!["The Album".to_string()]);

        let store = MapTagStore {
            tags: BTreeMap::from([(track.clone(), tags)]),
        };
        let identity = guess_album_identity(&store, &[track]);
        assert_eq!(identity.artist.as_deref(), Some("Album Artist"));
        assert_eq!(identity.album.as_deref(), Some("The Album"));
    }

    #[test]
    fn test_guess_album_identity_falls_back_to_artist() {
        let track = PathBuf::from("/music/first.flac");
        let mut tags = TagMap::new();
        tags.insert("artist".to_string(), vec!["Solo".to_string()]);

        let store = MapTagStore {
            tags: BTreeMap::from([(track.clone(), tags)]),
        };
        let identity = guess_album_identity(&store, &[track]);
        assert_eq!(identity.artist.as_deref(), Some("Solo"));
        assert_eq!(identity.album, None);
    }

    #[test]
    fn test_guess_album_identity_empty_batch() {
        let store = MapTagStore {
            tags: BTreeMap::new(),
        };
        assert_eq!(guess_album_identity(&store, &[]), AlbumIdentity::default());
    }
}
