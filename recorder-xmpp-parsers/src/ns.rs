/// Jitsi Meet presence extensions (stats-id and friends).
pub const JITSI_MEET: &str = "http://jitsi.org/jitmeet";

/// Jitsi Meet audio-muted presence flag.
pub const JITSI_MEET_AUDIO: &str = "http://jitsi.org/jitmeet/audio";

/// Jitsi Meet video-muted presence flag.
pub const JITSI_MEET_VIDEO: &str = "http://jitsi.org/jitmeet/video";

/// The conference focus protocol (bridge-session et al).
pub const JITSI_FOCUS: &str = "http://jitsi.org/protocol/focus";

/// Colibri v1: channel-based bridge control.
pub const COLIBRI: &str = "http://jitsi.org/protocol/colibri";

/// Colibri v2: conference-modify based bridge control.
pub const COLIBRI2: &str = "urn:xmpp:jitsi-videobridge:colibri2";
