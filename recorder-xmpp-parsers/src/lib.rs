//! Typed wrappers for the non-standard XMPP elements spoken by a Jitsi Meet
//! deployment: Jingle contents as Jicofo emits them, Colibri v1 and v2 bridge
//! control, and the focus extensions.

#[macro_use]
mod macros;

pub mod colibri;
pub mod colibri2;
pub mod focus;
mod helpers;
pub mod jingle;
pub mod jingle_dtls_srtp;
pub mod jingle_ice_udp;
pub mod jingle_rtp;
pub mod jingle_ssma;
pub mod ns;
