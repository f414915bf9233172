//! Target audio formats and their transcoder presets

use std::str::FromStr;

use crate::error::Error;

/// Audio format produced by the transcoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AudioFormat {
    /// MPEG-1 Layer III
    #[default]
    Mp3,
    /// AAC in an MP4 container
    M4a,
    /// Raw AAC (ADTS)
    Aac,
    /// Opus in Ogg
    Opus,
    /// Vorbis in Ogg
    Vorbis,
    /// Alias for Vorbis in Ogg
    Ogg,
    /// FLAC
    Flac,
    /// 16-bit PCM WAV
    Wav,
    /// Apple Lossless in an MP4 container
    Alac,
}

impl AudioFormat {
    /// All supported formats
    pub const ALL: [AudioFormat; 9] = [
        AudioFormat::Mp3,
        AudioFormat::M4a,
        AudioFormat::Aac,
        AudioFormat::Opus,
        AudioFormat::Vorbis,
        AudioFormat::Ogg,
        AudioFormat::Flac,
        AudioFormat::Wav,
        AudioFormat::Alac,
    ];

    /// Short name, also used as the file extension
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::M4a => "m4a",
            AudioFormat::Aac => "aac",
            AudioFormat::Opus => "opus",
            AudioFormat::Vorbis => "vorbis",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Flac => "flac",
            AudioFormat::Wav => "wav",
            AudioFormat::Alac => "alac",
        }
    }

    /// Codec arguments passed to the transcoder
    pub fn transcoder_args(&self) -> &'static [&'static str] {
        match self {
            AudioFormat::Mp3 => &["-vn", "-acodec", "libmp3lame", "-b:a", "192k"],
            AudioFormat::M4a | AudioFormat::Aac => &["-vn", "-acodec", "aac", "-b:a", "192k"],
            AudioFormat::Opus => &["-vn", "-c:a", "libopus", "-b:a", "128k"],
            AudioFormat::Vorbis | AudioFormat::Ogg => &["-vn", "-c:a", "libvorbis", "-q:a", "5"],
            AudioFormat::Flac => &["-vn", "-acodec", "flac"],
            AudioFormat::Wav => &["-vn", "-acodec", "pcm_s16le"],
            AudioFormat::Alac => &["-vn", "-acodec", "alac"],
        }
    }

    /// Muxer name for the transcoder's `-f` flag
    ///
    /// MP4-based formats use the `ipod` muxer; writing to a pipe additionally
    /// needs fragmented output, see [`AudioFormat::needs_fragmented_mp4`].
    pub fn muxer(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::M4a | AudioFormat::Alac => "ipod",
            AudioFormat::Aac => "adts",
            AudioFormat::Opus | AudioFormat::Vorbis | AudioFormat::Ogg => "ogg",
            AudioFormat::Flac => "flac",
            AudioFormat::Wav => "wav",
        }
    }

    /// Whether the container must be fragmented to be written to a pipe
    pub fn needs_fragmented_mp4(&self) -> bool {
        matches!(self, AudioFormat::M4a | AudioFormat::Alac)
    }

    /// HTTP content type of the transcoded output
    pub fn content_type(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::M4a | AudioFormat::Alac => "audio/mp4",
            AudioFormat::Aac => "audio/aac",
            AudioFormat::Opus | AudioFormat::Vorbis | AudioFormat::Ogg => "audio/ogg",
            AudioFormat::Flac => "audio/flac",
            AudioFormat::Wav => "audio/wav",
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        AudioFormat::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == lower)
            .ok_or_else(|| Error::InvalidKey(format!("unsupported format {}", s)))
    }
}
