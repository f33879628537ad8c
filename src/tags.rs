//! Tag and audio-property access for tracks.
//!
//! The conversion core never touches tag containers directly; it goes
//! through the [`TagStore`] trait so tests can substitute an in-memory
//! double. [`LoftyTagStore`] is the real implementation.

use lofty::config::WriteOptions;
use lofty::picture::{MimeType, Picture, PictureType};
use lofty::prelude::*;
use lofty::probe::Probe;
use lofty::tag::{ItemValue, Tag, TagItem};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while reading or writing tags.
#[derive(Debug, Error)]
pub enum TagError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tag error: {0}")]
    Lofty(#[from] lofty::error::LoftyError),

    #[error("no tag container in {0}")]
    NoTag(String),
}

/// A track's tag map. Keys are lower-cased field names; a field can carry
/// multiple values (multiple artists, for instance). Ordered so that
/// iteration, and therefore tag migration, is deterministic.
pub type TagMap = BTreeMap<String, Vec<String>>;

/// Numeric audio properties of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioProperties {
    pub bit_depth: u32,
    pub sample_rate: u32,
}

/// One embedded picture, detached from any particular tag format.
#[derive(Debug, Clone)]
pub struct Artwork {
    pub mime_type: Option<String>,
    pub description: String,
    pub pic_type: PictureType,
    pub data: Vec<u8>,
}

/// Read/write access to a track's tag store and audio properties.
pub trait TagStore: Send + Sync {
    /// Read the track's tag map (lower-cased keys, all values).
    fn read_tags(&self, path: &Path) -> Result<TagMap, TagError>;

    /// Read the track's bit depth and sample rate.
    fn audio_properties(&self, path: &Path) -> Result<AudioProperties, TagError>;

    /// Read the track's embedded pictures.
    fn artwork(&self, path: &Path) -> Result<Vec<Artwork>, TagError>;

    /// Upsert the given fields, leaving all other fields untouched.
    fn write_tags(&self, path: &Path, tags: &TagMap) -> Result<(), TagError>;

    /// Replace the track's tag container with exactly the given fields
    /// and pictures; anything not listed is stripped.
    fn replace_all_tags(
        &self,
        path: &Path,
        tags: &TagMap,
        artwork: &[Artwork],
    ) -> Result<(), TagError>;

    /// Remove the given fields (lower-cased names), keeping the rest.
    fn remove_tags(&self, path: &Path, names: &[&str]) -> Result<(), TagError>;
}

/// Map a lofty item key onto our lower-cased field vocabulary.
fn field_name(key: &ItemKey) -> String {
    let name = match key {
        ItemKey::AlbumArtist => "albumartist",
        ItemKey::TrackArtist => "artist",
        ItemKey::AlbumTitle => "album",
        ItemKey::TrackTitle => "title",
        ItemKey::TrackNumber => "tracknumber",
        ItemKey::TrackTotal => "tracktotal",
        ItemKey::DiscNumber => "discnumber",
        ItemKey::DiscTotal => "disctotal",
        ItemKey::Genre => "genre",
        ItemKey::Composer => "composer",
        ItemKey::Comment => "comment",
        ItemKey::Year => "year",
        ItemKey::RecordingDate => "date",
        ItemKey::EncoderSoftware => "encoder",
        ItemKey::EncoderSettings => "encoder_options",
        ItemKey::Unknown(raw) => return raw.to_lowercase(),
        other => return format!("{:?}", other).to_lowercase(),
    };
    name.to_string()
}

/// Inverse of [`field_name`] for the fields we write. Unmapped names pass
/// through as raw upper-cased keys, which is the conventional spelling in
/// both Vorbis comments and TXXX frames.
fn item_key(name: &str) -> ItemKey {
    match name {
        "albumartist" => ItemKey::AlbumArtist,
        "artist" => ItemKey::TrackArtist,
        "album" => ItemKey::AlbumTitle,
        "title" => ItemKey::TrackTitle,
        "tracknumber" => ItemKey::TrackNumber,
        "tracktotal" => ItemKey::TrackTotal,
        "discnumber" => ItemKey::DiscNumber,
        "disctotal" => ItemKey::DiscTotal,
        "genre" => ItemKey::Genre,
        "composer" => ItemKey::Composer,
        "comment" => ItemKey::Comment,
        "year" => ItemKey::Year,
        "date" => ItemKey::RecordingDate,
        other => ItemKey::Unknown(other.to_uppercase()),
    }
}

fn mime_from_str(mime: &str) -> MimeType {
    match mime {
        "image/png" => MimeType::Png,
        "image/jpeg" => MimeType::Jpeg,
        "image/gif" => MimeType::Gif,
        "image/bmp" => MimeType::Bmp,
        "image/tiff" => MimeType::Tiff,
        other => MimeType::Unknown(other.to_string()),
    }
}

fn artwork_from_picture(picture: &Picture) -> Artwork {
    Artwork {
        mime_type: picture.mime_type().map(|m| m.as_str().to_string()),
        description: picture.description().unwrap_or_default().to_string(),
        pic_type: picture.pic_type(),
        data: picture.data().to_vec(),
    }
}

fn picture_from_artwork(artwork: &Artwork) -> Picture {
    let description = if artwork.description.is_empty() {
        None
    } else {
        Some(artwork.description.clone())
    };
    Picture::new_unchecked(
        artwork.pic_type,
        artwork.mime_type.as_deref().map(mime_from_str),
        description,
        artwork.data.clone(),
    )
}

/// Tag store backed by lofty.
#[derive(Debug, Default)]
pub struct LoftyTagStore;

impl LoftyTagStore {
    pub fn new() -> Self {
        Self
    }
}

impl TagStore for LoftyTagStore {
    fn read_tags(&self, path: &Path) -> Result<TagMap, TagError> {
        let tagged = Probe::open(path)?.read()?;

        // Merge containers front to back; the first container that
        // defines a field wins, later containers only add new fields.
        let mut merged = TagMap::new();
        for tag in tagged.tags() {
            let mut current = TagMap::new();
            for item in tag.items() {
                if let ItemValue::Text(text) = item.value() {
                    current
                        .entry(field_name(item.key()))
                        .or_default()
                        .push(text.clone());
                }
            }
            for (name, values) in current {
                merged.entry(name).or_insert(values);
            }
        }
        Ok(merged)
    }

    fn audio_properties(&self, path: &Path) -> Result<AudioProperties, TagError> {
        let tagged = Probe::open(path)?.read()?;
        let properties = tagged.properties();
        Ok(AudioProperties {
            bit_depth: properties.bit_depth().map(u32::from).unwrap_or(0),
            sample_rate: properties.sample_rate().unwrap_or(0),
        })
    }

    fn artwork(&self, path: &Path) -> Result<Vec<Artwork>, TagError> {
        let tagged = Probe::open(path)?.read()?;
        let pictures = match tagged.primary_tag() {
            Some(tag) => tag.pictures().iter().map(artwork_from_picture).collect(),
            None => Vec::new(),
        };
        Ok(pictures)
    }

    fn write_tags(&self, path: &Path, tags: &TagMap) -> Result<(), TagError> {
        let mut tagged = Probe::open(path)?.read()?;
        let tag_type = tagged.primary_tag_type();
        if tagged.tag_mut(tag_type).is_none() {
            tagged.insert_tag(Tag::new(tag_type));
        }
        let tag = tagged
            .tag_mut(tag_type)
            .ok_or_else(|| TagError::NoTag(path.display().to_string()))?;

        for (name, values) in tags {
            let key = item_key(name);
            let mut values = values.iter();
            if let Some(first) = values.next() {
                // insert replaces every existing item under the key, the
                // remaining values are appended alongside it
                tag.insert(TagItem::new(key.clone(), ItemValue::Text(first.clone())));
                for value in values {
                    tag.push(TagItem::new(key.clone(), ItemValue::Text(value.clone())));
                }
            }
        }

        tagged.save_to_path(path, WriteOptions::default())?;
        Ok(())
    }

    fn replace_all_tags(
        &self,
        path: &Path,
        tags: &TagMap,
        artwork: &[Artwork],
    ) -> Result<(), TagError> {
        let tagged = Probe::open(path)?.read()?;
        let mut tag = Tag::new(tagged.primary_tag_type());

        for (name, values) in tags {
            let key = item_key(name);
            for value in values {
                tag.push(TagItem::new(key.clone(), ItemValue::Text(value.clone())));
            }
        }
        for piece in artwork {
            tag.push_picture(picture_from_artwork(piece));
        }

        tag.save_to_path(path, WriteOptions::default())?;
        Ok(())
    }

    fn remove_tags(&self, path: &Path, names: &[&str]) -> Result<(), TagError> {
        let tagged = Probe::open(path)?.read()?;
        let tag_type = tagged.primary_tag_type();
        let Some(old) = tagged.primary_tag() else {
            return Ok(());
        };

        let mut replacement = Tag::new(tag_type);
        for item in old.items() {
            if !names.contains(&field_name(item.key()).as_str()) {
                replacement.push(item.clone());
            }
        }
        for picture in old.pictures() {
            replacement.push_picture(picture.clone());
        }

        replacement.save_to_path(path, WriteOptions::default())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_name_maps_common_keys() {
        assert_eq!(field_name(&ItemKey::AlbumArtist), "albumartist");
        assert_eq!(field_name(&ItemKey::TrackTitle), "title");
        assert_eq!(field_name(&ItemKey::TrackNumber), "tracknumber");
        assert_eq!(
            field_name(&ItemKey::Unknown("ReplayGain_Track_Gain".to_string())),
            "replaygain_track_gain"
        );
    }

    #[test]
    fn test_item_key_round_trips_mapped_names() {
        for name in [
            "albumartist",
            "artist",
            "album",
            "title",
            "tracknumber",
            "genre",
            "composer",
            "date",
        ] {
            assert_eq!(field_name(&item_key(name)), name);
        }
    }

    #[test]
    fn test_item_key_upper_cases_custom_names() {
        assert_eq!(
            item_key("replaygain_reference_loudness"),
            ItemKey::Unknown("REPLAYGAIN_REFERENCE_LOUDNESS".to_string())
        );
        assert_eq!(
            field_name(&item_key("replaygain_reference_loudness")),
            "replaygain_reference_loudness"
        );
    }

    #[test]
    fn test_mime_round_trip() {
        let artwork = Artwork {
            mime_type: Some("image/png".to_string()),
            description: String::new(),
            pic_type: PictureType::CoverFront,
            data: vec![1, 2, 3],
        };
        let picture = picture_from_artwork(&artwork);
        let back = artwork_from_picture(&picture);
        assert_eq!(back.mime_type.as_deref(), Some("image/png"));
        assert_eq!(back.pic_type, PictureType::CoverFront);
        assert_eq!(back.data, vec![1, 2, 3]);
    }
}
