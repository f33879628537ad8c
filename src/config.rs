//! Conversion configuration: target codec, typed presets, tool overrides.

use clap::ValueEnum;
use std::path::PathBuf;

/// Target codec for a conversion batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Codec {
    Flac,
    Opus,
    Mp3,
}

impl Codec {
    /// Display label, also used by the `&codec&` template field.
    pub fn label(&self) -> &'static str {
        match self {
            Codec::Flac => "FLAC",
            Codec::Opus => "Opus",
            Codec::Mp3 => "MP3",
        }
    }

    /// Output file extension (without the dot).
    pub fn extension(&self) -> &'static str {
        match self {
            Codec::Flac => "flac",
            Codec::Opus => "opus",
            Codec::Mp3 => "mp3",
        }
    }
}

/// FLAC presets. The non-standard variants request a SoX transform pass
/// for tracks that actually exceed the target format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlacPreset {
    Standard,
    Force16Bit,
    ForceBaseRate,
    Force16BitAndBaseRate,
}

impl FlacPreset {
    pub fn label(&self) -> &'static str {
        match self {
            FlacPreset::Standard => "Standard",
            FlacPreset::Force16Bit => "Force 16-bit",
            FlacPreset::ForceBaseRate => "Force 44.1kHz/48kHz",
            FlacPreset::Force16BitAndBaseRate => "Force 16-bit and 44.1kHz/48kHz",
        }
    }

    /// True when the preset asks for a 16-bit reduction.
    pub fn forces_bit_depth(&self) -> bool {
        matches!(self, FlacPreset::Force16Bit | FlacPreset::Force16BitAndBaseRate)
    }

    /// True when the preset asks for resampling to a base rate.
    pub fn forces_sample_rate(&self) -> bool {
        matches!(self, FlacPreset::ForceBaseRate | FlacPreset::Force16BitAndBaseRate)
    }

    /// True when any transform is requested at all.
    pub fn requests_transform(&self) -> bool {
        !matches!(self, FlacPreset::Standard)
    }
}

/// Opus presets: VBR at a target bitrate in kbps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpusPreset {
    pub bitrate: u32,
}

impl OpusPreset {
    pub fn label(&self) -> String {
        format!("{}kbps VBR", self.bitrate)
    }

    pub fn short_label(&self) -> String {
        self.bitrate.to_string()
    }
}

/// MP3 presets: LAME VBR quality level or CBR bitrate in kbps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mp3Preset {
    Vbr(u8),
    Cbr(u32),
}

impl Mp3Preset {
    /// Nominal bitrate of a LAME VBR level, used for the long label.
    fn vbr_nominal_kbps(level: u8) -> u32 {
        match level {
            0 => 245,
            1 => 225,
            2 => 190,
            3 => 175,
            4 => 165,
            5 => 130,
            6 => 115,
            7 => 100,
            8 => 85,
            _ => 65,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Mp3Preset::Vbr(level) => format!(
                "{}kbps VBR (V{})",
                Self::vbr_nominal_kbps(*level),
                level
            ),
            Mp3Preset::Cbr(kbps) => format!("{}kbps CBR", kbps),
        }
    }

    pub fn short_label(&self) -> String {
        match self {
            Mp3Preset::Vbr(level) => format!("V{}", level),
            Mp3Preset::Cbr(kbps) => kbps.to_string(),
        }
    }
}

/// A codec-specific preset carrying its encoded parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Flac(FlacPreset),
    Opus(OpusPreset),
    Mp3(Mp3Preset),
}

impl Preset {
    pub fn codec(&self) -> Codec {
        match self {
            Preset::Flac(_) => Codec::Flac,
            Preset::Opus(_) => Codec::Opus,
            Preset::Mp3(_) => Codec::Mp3,
        }
    }

    /// Long human-readable label, e.g. "245kbps VBR (V0)".
    pub fn label(&self) -> String {
        match self {
            Preset::Flac(p) => p.label().to_string(),
            Preset::Opus(p) => p.label(),
            Preset::Mp3(p) => p.label(),
        }
    }

    /// Short label used in folder/file names, e.g. "V0" or "320".
    /// FLAC presets have no short form; the long label is used as-is.
    pub fn short_label(&self) -> String {
        match self {
            Preset::Flac(p) => p.label().to_string(),
            Preset::Opus(p) => p.short_label(),
            Preset::Mp3(p) => p.short_label(),
        }
    }

    /// Parse a preset string for the given codec. Accepts both the long
    /// labels and the short forms the labels normalize to.
    pub fn parse(codec: Codec, input: &str) -> Option<Preset> {
        let s = input.trim();
        match codec {
            Codec::Flac => {
                let preset = match s.to_lowercase().as_str() {
                    "standard" => FlacPreset::Standard,
                    "force 16-bit" | "force-16bit" => FlacPreset::Force16Bit,
                    "force 44.1khz/48khz" | "force-rate" => FlacPreset::ForceBaseRate,
                    "force 16-bit and 44.1khz/48khz" | "force-16bit-rate" => {
                        FlacPreset::Force16BitAndBaseRate
                    }
                    _ => return None,
                };
                Some(Preset::Flac(preset))
            }
            Codec::Opus => {
                let bitrate = parse_kbps(s)?;
                const OPUS_BITRATES: &[u32] = &[192, 160, 128, 96, 64, 32];
                OPUS_BITRATES
                    .contains(&bitrate)
                    .then_some(Preset::Opus(OpusPreset { bitrate }))
            }
            Codec::Mp3 => {
                if let Some(level) = parse_vbr_level(s) {
                    return (level <= 9).then_some(Preset::Mp3(Mp3Preset::Vbr(level)));
                }
                let kbps = parse_kbps(s)?;
                const MP3_CBR_BITRATES: &[u32] = &[320, 256, 192, 128, 64];
                MP3_CBR_BITRATES
                    .contains(&kbps)
                    .then_some(Preset::Mp3(Mp3Preset::Cbr(kbps)))
            }
        }
    }
}

/// "320", "320kbps CBR", "192kbps VBR" -> the leading number.
fn parse_kbps(s: &str) -> Option<u32> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// "V0", "v3", or the long "245kbps VBR (V0)" form -> the level.
fn parse_vbr_level(s: &str) -> Option<u8> {
    let s = s.trim();
    let tail = if let Some(open) = s.find("(V").or_else(|| s.find("(v")) {
        s.get(open + 2..s.len().saturating_sub(1)).unwrap_or("")
    } else if let Some(stripped) = s.strip_prefix('V').or_else(|| s.strip_prefix('v')) {
        stripped
    } else {
        return None;
    };
    tail.parse().ok()
}

/// Everything the pipeline needs to know about one conversion batch.
#[derive(Debug, Clone)]
pub struct ConversionConfig {
    pub preset: Preset,
    /// Naming template mixing literal text with `%tag%` and `&field&`
    /// markers; evaluated relative to `output_dir`.
    pub template: String,
    pub output_dir: PathBuf,
    /// Whether to run the loudness-tagging stage.
    pub apply_loudness: bool,
}

impl ConversionConfig {
    pub fn codec(&self) -> Codec {
        self.preset.codec()
    }
}

/// Explicit overrides for the external tool executables. An unset entry
/// means "search the PATH for the conventional binary name".
#[derive(Debug, Clone, Default)]
pub struct ToolPaths {
    pub flac: Option<PathBuf>,
    pub sox: Option<PathBuf>,
    pub opusenc: Option<PathBuf>,
    pub lame: Option<PathBuf>,
    pub loudgain: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_long_labels() {
        assert_eq!(Preset::Mp3(Mp3Preset::Vbr(0)).label(), "245kbps VBR (V0)");
        assert_eq!(Preset::Mp3(Mp3Preset::Vbr(9)).label(), "65kbps VBR (V9)");
        assert_eq!(Preset::Mp3(Mp3Preset::Cbr(320)).label(), "320kbps CBR");
        assert_eq!(Preset::Opus(OpusPreset { bitrate: 192 }).label(), "192kbps VBR");
        assert_eq!(Preset::Flac(FlacPreset::Standard).label(), "Standard");
    }

    #[test]
    fn test_preset_short_labels() {
        assert_eq!(Preset::Mp3(Mp3Preset::Vbr(0)).short_label(), "V0");
        assert_eq!(Preset::Mp3(Mp3Preset::Cbr(320)).short_label(), "320");
        assert_eq!(Preset::Opus(OpusPreset { bitrate: 96 }).short_label(), "96");
        assert_eq!(
            Preset::Flac(FlacPreset::Force16Bit).short_label(),
            "Force 16-bit"
        );
    }

    #[test]
    fn test_parse_accepts_long_and_short_forms() {
        assert_eq!(
            Preset::parse(Codec::Mp3, "245kbps VBR (V0)"),
            Some(Preset::Mp3(Mp3Preset::Vbr(0)))
        );
        assert_eq!(
            Preset::parse(Codec::Mp3, "v2"),
            Some(Preset::Mp3(Mp3Preset::Vbr(2)))
        );
        assert_eq!(
            Preset::parse(Codec::Mp3, "320kbps CBR"),
            Some(Preset::Mp3(Mp3Preset::Cbr(320)))
        );
        assert_eq!(
            Preset::parse(Codec::Opus, "160"),
            Some(Preset::Opus(OpusPreset { bitrate: 160 }))
        );
        assert_eq!(
            Preset::parse(Codec::Flac, "force 16-bit"),
            Some(Preset::Flac(FlacPreset::Force16Bit))
        );
    }

    #[test]
    fn test_parse_rejects_unknown_presets() {
        assert_eq!(Preset::parse(Codec::Mp3, "v10"), None);
        assert_eq!(Preset::parse(Codec::Mp3, "300kbps CBR"), None);
        assert_eq!(Preset::parse(Codec::Opus, "500"), None);
        assert_eq!(Preset::parse(Codec::Flac, "mega"), None);
    }

    #[test]
    fn test_flac_preset_transform_flags() {
        assert!(!FlacPreset::Standard.requests_transform());
        assert!(FlacPreset::Force16Bit.forces_bit_depth());
        assert!(!FlacPreset::Force16Bit.forces_sample_rate());
        assert!(FlacPreset::ForceBaseRate.forces_sample_rate());
        assert!(FlacPreset::Force16BitAndBaseRate.forces_bit_depth());
        assert!(FlacPreset::Force16BitAndBaseRate.forces_sample_rate());
    }
}
