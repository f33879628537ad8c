//! The naming-template engine.
//!
//! A template is user-authored text mixing literals with `%tag%` markers
//! (looked up in the track's tag map) and `&field&` markers (computed from
//! the conversion context), e.g.
//! `%albumartist%/%album% (&smartbit&)/&paddedtracknumber& - %title%`.
//!
//! Resolution is a pure function of the template and a [`RenderContext`];
//! unresolvable references contribute nothing and unmatched markers
//! degrade to literal characters, so resolution cannot fail.

use crate::config::{Codec, Preset};
use crate::tags::{AudioProperties, TagMap};

/// Characters that cannot appear in file names, and the full-width
/// lookalikes they are replaced with. The two lists line up
/// index-for-index; replacements are applied serially.
const REPLACEABLE_ILLEGAL_CHARS: [char; 11] =
    ['\\', '/', ':', '*', '?', '"', '“', '”', '<', '>', '|'];
const FULL_WIDTH_REPLACEMENTS: [char; 11] =
    ['＼', '／', '：', '＊', '？', '＂', '＂', '＂', '＜', '＞', '｜'];

/// Clean a string of characters that are invalid in file names.
///
/// Control characters (code points <= 31 and 127) are removed, the ends
/// are trimmed of whitespace, and each illegal character is replaced with
/// its full-width counterpart unless it appears in `ignored`.
pub fn clean(input: &str, ignored: &str) -> String {
    if input.is_empty() {
        return String::new();
    }

    let without_control: String = input
        .chars()
        .filter(|&c| (c as u32) > 31 && (c as u32) != 127)
        .collect();

    without_control
        .trim()
        .chars()
        .map(|c| {
            if ignored.contains(c) {
                return c;
            }
            match REPLACEABLE_ILLEGAL_CHARS.iter().position(|&illegal| illegal == c) {
                Some(index) => FULL_WIDTH_REPLACEMENTS[index],
                None => c,
            }
        })
        .collect()
}

/// A computed `&field&` reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    BitDepth,
    SampleRate,
    ShortSampleRate,
    Codec,
    Bitrate,
    SmartBit,
    PaddedTrackNumber,
}

impl Field {
    fn from_name(name: &str) -> Option<Field> {
        match name {
            "bps" => Some(Field::BitDepth),
            "samplerate" => Some(Field::SampleRate),
            "short-samplerate" => Some(Field::ShortSampleRate),
            "codec" => Some(Field::Codec),
            "bitrate" => Some(Field::Bitrate),
            "smartbit" => Some(Field::SmartBit),
            "paddedtracknumber" => Some(Field::PaddedTrackNumber),
            _ => None,
        }
    }
}

/// One parsed piece of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Tag(String),
    Field(Field),
}

/// Everything a template can reference while resolving one track.
#[derive(Debug, Clone)]
pub struct RenderContext<'a> {
    pub tags: &'a TagMap,
    pub properties: AudioProperties,
    pub preset: &'a Preset,
    /// Batch-level bit depth the track will end up with, when the batch
    /// disambiguates naming; `None` means "use the track's own".
    pub future_bit_depth: Option<u32>,
    /// Batch-level sample rate, same convention.
    pub future_sample_rate: Option<u32>,
}

impl RenderContext<'_> {
    fn bit_depth(&self) -> u32 {
        self.future_bit_depth.unwrap_or(self.properties.bit_depth)
    }

    fn sample_rate(&self) -> u32 {
        self.future_sample_rate.unwrap_or(self.properties.sample_rate)
    }

    /// First two decimal digits of the sample rate: 44 for 44100, 96 for
    /// 96000. Intentionally a plain string truncation.
    fn short_sample_rate(&self) -> String {
        self.sample_rate().to_string().chars().take(2).collect()
    }
}

/// A parsed naming template: an immutable sequence of segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parse template syntax. Never fails: an opening marker without a
    /// matching closer is kept as literal text, and an unknown computed
    /// field resolves to nothing.
    pub fn parse(syntax: &str) -> Template {
        // NT folder delimiters become the UNIX form up front
        let syntax = syntax.replace('\\', "/");

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut i = 0;

        while i < syntax.len() {
            let rest = &syntax[i..];
            let Some(ch) = rest.chars().next() else {
                break;
            };

            if ch == '%' || ch == '&' {
                if let Some(offset) = rest[1..].find(ch) {
                    let name = rest[1..1 + offset].to_lowercase();
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    if ch == '%' {
                        segments.push(Segment::Tag(name));
                    } else if let Some(field) = Field::from_name(&name) {
                        segments.push(Segment::Field(field));
                    }
                    i += offset + 2;
                    continue;
                }
            }

            literal.push(ch);
            i += ch.len_utf8();
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Template { segments }
    }

    /// Resolve the template against one track, producing a relative path
    /// fragment (no extension). Pure: the same inputs always produce the
    /// same output.
    pub fn resolve(&self, ctx: &RenderContext) -> String {
        let mut out = String::new();

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => {
                    for ch in text.chars() {
                        if ch == '/' {
                            // trailing spaces and periods are not allowed
                            // at the end of a folder name
                            trim_segment_end(&mut out);
                        }
                        out.push(ch);
                    }
                }
                Segment::Tag(name) => {
                    if let Some(first) = ctx.tags.get(name).and_then(|values| values.first()) {
                        out.push_str(&clean(first.trim(), ""));
                    }
                }
                Segment::Field(field) => out.push_str(&resolve_field(*field, ctx)),
            }
        }

        // Clean the whole resolved path, keeping folder delimiters, then
        // trim the final segment's end like any other folder name.
        let mut resolved = clean(&out, "/");
        trim_segment_end(&mut resolved);
        resolved
    }
}

fn resolve_field(field: Field, ctx: &RenderContext) -> String {
    match field {
        Field::BitDepth => ctx.bit_depth().to_string(),
        Field::SampleRate => ctx.sample_rate().to_string(),
        Field::ShortSampleRate => ctx.short_sample_rate(),
        Field::Codec => ctx.preset.codec().label().to_string(),
        Field::Bitrate => ctx.preset.short_label(),
        Field::SmartBit => match ctx.preset.codec() {
            // Lossless: bit depth + short sample rate, e.g. "16-44"
            Codec::Flac => format!("{}-{}", ctx.bit_depth(), ctx.short_sample_rate()),
            // Lossy: the preset's short form, e.g. "320" or "V0"
            Codec::Opus | Codec::Mp3 => ctx.preset.short_label(),
        },
        Field::PaddedTrackNumber => padded_track_number(ctx.tags),
    }
}

/// Track number padded to two digits: "01".."09" for 1-9, "00" for zero
/// or a missing/unparsable tag, the plain number otherwise.
fn padded_track_number(tags: &TagMap) -> String {
    let raw = tags
        .get("tracknumber")
        .or_else(|| tags.get("track"))
        .and_then(|values| values.first())
        .map(|value| clean(value.trim(), ""))
        .unwrap_or_default();

    let stripped = raw.trim_start_matches('0');
    let value: i64 = stripped.parse().unwrap_or(0);

    if (1..=9).contains(&value) {
        format!("0{}", stripped)
    } else if stripped.is_empty() || value == 0 {
        "00".to_string()
    } else {
        stripped.to_string()
    }
}

fn trim_segment_end(out: &mut String) {
    while out.ends_with(|c: char| c.is_whitespace() || c == '.') {
        out.pop();
    }
}
