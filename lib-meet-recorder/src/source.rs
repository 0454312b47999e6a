#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum MediaType {
  Audio,
  Video,
}

impl MediaType {
  pub(crate) fn from_sdp(media: &str) -> Option<MediaType> {
    match media {
      "audio" => Some(MediaType::Audio),
      "video" => Some(MediaType::Video),
      _ => None,
    }
  }

  pub(crate) fn jitsi_muted_presence_element_name(&self) -> &'static str {
    match self {
      MediaType::Video => "videomuted",
      MediaType::Audio => "audiomuted",
    }
  }
}

/// Per-SSRC metadata extracted from SSMA source elements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SsrcDescription {
  pub ssrc: u32,
  pub cname: String,
  pub msid: String,
  pub mslabel: String,
  pub label: String,
}
