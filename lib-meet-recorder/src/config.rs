use std::{env, path::PathBuf};

use anyhow::{bail, Result};

/// How the recorder authenticates its XMPP stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmppMode {
  Client,
  Component,
}

#[derive(Debug, Clone)]
pub struct XmppSettings {
  pub host: String,
  pub port: u16,
  pub domain: String,
  pub jid: String,
  pub password: String,
  pub mode: XmppMode,
}

impl XmppSettings {
  /// The stream endpoint. Prosody in a Jitsi deployment exposes the XMPP
  /// WebSocket at this well-known path.
  pub fn websocket_url(&self) -> String {
    format!("ws://{}:{}/xmpp-websocket", self.host, self.port)
  }

  /// The local-part of the configured JID, used as the brewery MUC nick.
  pub fn jid_local_part(&self) -> &str {
    self.jid.split('@').next().unwrap_or(&self.jid)
  }
}

#[derive(Debug, Clone)]
pub struct Settings {
  pub api_secret: Option<String>,
  pub recordings_root: PathBuf,
  pub http_bind: String,
  pub xmpp: Option<XmppSettings>,
  pub bridge_muc: String,
  pub colibri2_url: Option<String>,
  pub colibri2_ws: Option<String>,
  pub jvb_rest_url: String,
  pub recorder_ws_url: String,
  pub simulate: bool,
  pub tls_insecure: bool,
}

fn env_opt(key: &str) -> Option<String> {
  env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str) -> bool {
  matches!(
    env_opt(key).as_deref().map(str::to_lowercase).as_deref(),
    Some("1") | Some("true") | Some("yes")
  )
}

impl Settings {
  /// Load settings from the process environment.
  ///
  /// XMPP is optional: with neither client nor component credentials set, the
  /// recorder runs HTTP-only (explicit inputs and the legacy Colibri fallback
  /// still work). Component credentials win over client credentials, matching
  /// the deployment convention.
  pub fn from_env() -> Result<Self> {
    let xmpp = if let (Some(jid), Some(secret)) = (
      env_opt("XMPP_COMPONENT_JID"),
      env_opt("XMPP_COMPONENT_SECRET"),
    ) {
      Some(XmppSettings {
        host: env_opt("XMPP_COMPONENT_HOST").unwrap_or_else(|| "xmpp.meet.jitsi".to_owned()),
        port: env_opt("XMPP_COMPONENT_PORT")
          .map(|p| p.parse())
          .transpose()?
          .unwrap_or(5347),
        domain: env_opt("XMPP_DOMAIN").unwrap_or_else(|| "meet.jitsi".to_owned()),
        jid,
        password: secret,
        mode: XmppMode::Component,
      })
    }
    else if let Some(jid) = env_opt("XMPP_JID") {
      let Some(password) = env_opt("XMPP_PASSWORD")
      else {
        bail!("XMPP_JID is set but XMPP_PASSWORD is missing");
      };
      Some(XmppSettings {
        host: env_opt("XMPP_HOST").unwrap_or_else(|| "xmpp.meet.jitsi".to_owned()),
        port: env_opt("XMPP_PORT")
          .map(|p| p.parse())
          .transpose()?
          .unwrap_or(5222),
        domain: env_opt("XMPP_DOMAIN").unwrap_or_else(|| "meet.jitsi".to_owned()),
        jid,
        password,
        mode: XmppMode::Client,
      })
    }
    else {
      None
    };

    Ok(Settings {
      api_secret: env_opt("RECORDER_API_SECRET"),
      recordings_root: env_opt("RECORDINGS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/recordings/ffmpeg")),
      http_bind: env_opt("RECORDER_HTTP_BIND").unwrap_or_else(|| "0.0.0.0:8000".to_owned()),
      xmpp,
      bridge_muc: env_opt("JVB_BRIDGE_MUC")
        .unwrap_or_else(|| "jvbbrewery@internal-muc.meet.jitsi".to_owned()),
      colibri2_url: env_opt("JVB_COLIBRI2_URL"),
      colibri2_ws: env_opt("JVB_COLIBRI2_WS"),
      jvb_rest_url: env_opt("JVB_REST_URL").unwrap_or_else(|| "http://jvb:8080".to_owned()),
      recorder_ws_url: env_opt("RECORDER_WS_URL")
        .unwrap_or_else(|| "ws://recorder:8989/record".to_owned()),
      simulate: env_bool("COLIBRI2_SIMULATE"),
      tls_insecure: env_bool("RECORDER_TLS_INSECURE"),
    })
  }

  pub fn xmpp_enabled(&self) -> bool {
    self.xmpp.is_some() && !self.simulate
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn jid_local_part() {
    let settings = XmppSettings {
      host: "xmpp.meet.jitsi".to_owned(),
      port: 5222,
      domain: "meet.jitsi".to_owned(),
      jid: "recorder@auth.meet.jitsi".to_owned(),
      password: "secret".to_owned(),
      mode: XmppMode::Client,
    };
    assert_eq!(settings.jid_local_part(), "recorder");
    assert_eq!(
      settings.websocket_url(),
      "ws://xmpp.meet.jitsi:5222/xmpp-websocket"
    );
  }
}
