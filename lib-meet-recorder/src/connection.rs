use std::{collections::HashMap, convert::TryFrom, fmt, future::Future, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{
  sink::{Sink, SinkExt},
  stream::{Stream, StreamExt, TryStreamExt},
};
use rand::{thread_rng, RngCore};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::{
  http::{Request, Uri},
  Message,
};
use tracing::{debug, error, info, warn};
use xmpp_parsers::{
  bind::{BindQuery, BindResponse},
  iq::{Iq, IqType},
  presence::{self, Presence},
  roster::Roster,
  sasl::{Auth, Mechanism, Success},
  websocket::Open,
  BareJid, Element, FullJid, Jid,
};

use crate::{tls::wss_connector, util::generate_id};

/// A recorder component claiming stanzas off the idle stream.
///
/// Once the stream is bound, every inbound stanza that is not a reply to a
/// pending IQ is offered to the registered handlers in registration order;
/// the first whose `wants` matches consumes it. The recorder session is the
/// only long-lived handler, claiming MUC presence and the Jingle/Colibri
/// IQs.
#[async_trait]
pub trait StanzaHandler {
  fn wants(&self, element: &Element) -> bool;
  async fn handle(&self, element: Element) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
enum ConnectionState {
  OpeningPreAuthentication,
  ReceivingFeaturesPreAuthentication,
  Authenticating,
  OpeningPostAuthentication,
  ReceivingFeaturesPostAuthentication,
  Binding,
  FetchingRoster,
  Idle,
}

#[derive(Debug, Clone)]
pub enum Authentication {
  Anonymous,
  Plain { username: String, password: String },
}

struct ConnectionInner {
  state: ConnectionState,
  jid: Option<FullJid>,
  xmpp_domain: BareJid,
  authentication: Authentication,
  roster_iq_id: Option<String>,
  connected_tx: Option<oneshot::Sender<Result<()>>>,
  stanza_handlers: Vec<Box<dyn StanzaHandler + Send + Sync>>,
}

impl fmt::Debug for ConnectionInner {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConnectionInner")
      .field("state", &self.state)
      .field("jid", &self.jid)
      .finish()
  }
}

/// The long-lived XMPP stream shared by the brewery and conference MUCs.
#[derive(Debug, Clone)]
pub struct Connection {
  pub(crate) tx: mpsc::Sender<Element>,
  inner: Arc<Mutex<ConnectionInner>>,
  pending_iqs: Arc<Mutex<HashMap<String, oneshot::Sender<Iq>>>>,
  pub(crate) tls_insecure: bool,
}

impl Connection {
  pub async fn new(
    websocket_url: &str,
    xmpp_domain: &str,
    authentication: Authentication,
    tls_insecure: bool,
  ) -> Result<(Self, impl Future<Output = ()>)> {
    let websocket_url: Uri = websocket_url.parse().context("invalid WebSocket URL")?;
    let xmpp_domain: BareJid = xmpp_domain.parse().context("invalid XMPP domain")?;

    info!("Connecting XMPP WebSocket to {}", websocket_url);
    let mut key = [0u8; 16];
    thread_rng().fill_bytes(&mut key);
    let request = Request::get(&websocket_url)
      .header("sec-websocket-protocol", "xmpp")
      .header("sec-websocket-key", base64::encode(key))
      .header("sec-websocket-version", "13")
      .header(
        "host",
        websocket_url
          .host()
          .context("invalid WebSocket URL: missing host")?,
      )
      .header("connection", "Upgrade")
      .header("upgrade", "websocket")
      .body(())
      .context("failed to build WebSocket request")?;
    let (websocket, _response) = tokio_tungstenite::connect_async_tls_with_config(
      request,
      None,
      true,
      Some(wss_connector(tls_insecure).context("failed to build TLS connector")?),
    )
    .await
    .context("failed to connect XMPP WebSocket")?;
    let (sink, stream) = websocket.split();
    let (tx, rx) = mpsc::channel(64);

    let inner = Arc::new(Mutex::new(ConnectionInner {
      state: ConnectionState::OpeningPreAuthentication,
      jid: None,
      xmpp_domain,
      authentication,
      roster_iq_id: None,
      connected_tx: None,
      stanza_handlers: vec![],
    }));

    let pending_iqs = Arc::new(Mutex::new(HashMap::new()));

    let connection = Self {
      tx: tx.clone(),
      inner: inner.clone(),
      pending_iqs: pending_iqs.clone(),
      tls_insecure,
    };

    let writer = Connection::write_loop(rx, sink);
    let reader = Connection::read_loop(inner, pending_iqs, tx, stream);

    let background = async move {
      tokio::select! {
        res = reader => if let Err(e) = res { error!("fatal (in read loop): {:?}", e) },
        res = writer => if let Err(e) = res { error!("fatal (in write loop): {:?}", e) },
      }
    };

    Ok((connection, background))
  }

  pub async fn add_stanza_handler(&self, handler: impl StanzaHandler + Send + Sync + 'static) {
    let mut locked_inner = self.inner.lock().await;
    locked_inner.stanza_handlers.push(Box::new(handler));
  }

  /// Open the stream and drive it to the idle state: authenticated, bound,
  /// initial presence sent and roster fetched.
  pub async fn connect(&self) -> Result<()> {
    let (tx, rx) = oneshot::channel();

    {
      let mut locked_inner = self.inner.lock().await;
      locked_inner.connected_tx = Some(tx);
      let open = Open::new(locked_inner.xmpp_domain.clone());
      self.tx.send(open.into()).await?;
    }

    rx.await?
  }

  pub async fn jid(&self) -> Option<FullJid> {
    let locked_inner = self.inner.lock().await;
    locked_inner.jid.clone()
  }

  pub async fn send_stanza(&self, element: Element) -> Result<()> {
    self.tx.send(element).await?;
    Ok(())
  }

  /// Send an IQ and await its result or error within the given deadline.
  ///
  /// An error IQ is surfaced with its condition text; a missed deadline is a
  /// transport error.
  pub async fn send_iq_with_timeout(&self, iq: Iq, timeout: Duration) -> Result<Iq> {
    let id = iq.id.clone();
    let (tx, rx) = oneshot::channel();
    self.pending_iqs.lock().await.insert(id.clone(), tx);
    self.tx.send(iq.into()).await?;
    match tokio::time::timeout(timeout, rx).await {
      Ok(Ok(reply)) => match reply.payload {
        IqType::Error(ref error) => {
          bail!("iq error: {:?}", error.defined_condition)
        },
        _ => Ok(reply),
      },
      Ok(Err(_)) => bail!("iq channel closed"),
      Err(_) => {
        self.pending_iqs.lock().await.remove(&id);
        bail!("iq timeout after {:?}", timeout)
      },
    }
  }

  async fn write_loop<S>(rx: mpsc::Receiver<Element>, mut sink: S) -> Result<()>
  where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
  {
    let mut rx = ReceiverStream::new(rx);
    while let Some(element) = rx.next().await {
      let mut bytes = Vec::new();
      element.write_to(&mut bytes)?;
      let xml = String::from_utf8(bytes)?;
      debug!("XMPP    >>> {}", xml);
      sink.send(Message::Text(xml)).await?;
    }
    Ok(())
  }

  async fn read_loop<S>(
    inner: Arc<Mutex<ConnectionInner>>,
    pending_iqs: Arc<Mutex<HashMap<String, oneshot::Sender<Iq>>>>,
    tx: mpsc::Sender<Element>,
    mut stream: S,
  ) -> Result<()>
  where
    S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
  {
    loop {
      let message = stream
        .try_next()
        .await?
        .ok_or_else(|| anyhow!("unexpected EOF"))?;
      let element: Element = match message {
        Message::Text(xml) => {
          debug!("XMPP    <<< {}", xml);
          xml.parse()?
        },
        _ => {
          warn!(
            "unexpected non-text message on XMPP WebSocket stream: {:?}",
            message
          );
          continue;
        },
      };

      let mut locked_inner = inner.lock().await;

      use ConnectionState::*;
      match locked_inner.state {
        OpeningPreAuthentication => {
          Open::try_from(element)?;
          info!("Connected XMPP WebSocket");
          locked_inner.state = ReceivingFeaturesPreAuthentication;
        },
        ReceivingFeaturesPreAuthentication => {
          let auth = match &locked_inner.authentication {
            Authentication::Anonymous => Auth {
              mechanism: Mechanism::Anonymous,
              data: vec![],
            },
            Authentication::Plain { username, password } => {
              let mut data = Vec::with_capacity(username.len() + password.len() + 2);
              data.push(0u8);
              data.extend_from_slice(username.as_bytes());
              data.push(0u8);
              data.extend_from_slice(password.as_bytes());
              Auth {
                mechanism: Mechanism::Plain,
                data,
              }
            },
          };
          tx.send(auth.into()).await?;
          locked_inner.state = Authenticating;
        },
        Authenticating => {
          Success::try_from(element)?;

          let open = Open::new(locked_inner.xmpp_domain.clone());
          tx.send(open.into()).await?;
          locked_inner.state = OpeningPostAuthentication;
        },
        OpeningPostAuthentication => {
          Open::try_from(element)?;
          match &locked_inner.authentication {
            Authentication::Anonymous => info!("Logged in anonymously"),
            Authentication::Plain { .. } => info!("Logged in with PLAIN"),
          }
          locked_inner.state = ReceivingFeaturesPostAuthentication;
        },
        ReceivingFeaturesPostAuthentication => {
          let iq = Iq::from_set(generate_id(), BindQuery::new(None));
          tx.send(iq.into()).await?;
          locked_inner.state = Binding;
        },
        Binding => match Iq::try_from(element) {
          Ok(iq) => {
            let jid = if let IqType::Result(Some(element)) = iq.payload {
              let bind = BindResponse::try_from(element)?;
              FullJid::try_from(bind)?
            }
            else {
              bail!("bind failed");
            };
            info!("My JID: {}", jid);
            locked_inner.jid = Some(jid.clone());

            // Session start: initial presence, then the roster fetch.
            let presence = Presence::new(presence::Type::None);
            tx.send(presence.into()).await?;

            let roster_iq_id = generate_id();
            let iq = Iq::from_get(
              roster_iq_id.clone(),
              Roster {
                ver: None,
                items: vec![],
              },
            )
            .with_from(Jid::Full(jid.clone()));
            tx.send(iq.into()).await?;
            locked_inner.roster_iq_id = Some(roster_iq_id);
            locked_inner.state = FetchingRoster;
          },
          Err(e) => debug!(
            "received unexpected element while waiting for bind response: {}",
            e
          ),
        },
        FetchingRoster => match Iq::try_from(element) {
          Ok(iq) if Some(&iq.id) == locked_inner.roster_iq_id.as_ref() => {
            match iq.payload {
              IqType::Result(_) => debug!("roster fetched"),
              other => warn!("roster fetch failed: {:?}", other),
            }
            locked_inner.roster_iq_id = None;
            if let Some(tx) = locked_inner.connected_tx.take() {
              tx.send(Ok(())).map_err(|_| anyhow!("channel closed"))?;
            }
            locked_inner.state = Idle;
          },
          Ok(iq) => debug!("ignoring iq while fetching roster: {}", iq.id),
          Err(e) => debug!(
            "received unexpected element while waiting for roster: {}",
            e
          ),
        },
        Idle => {
          let reply_tx = if element.is("iq", xmpp_parsers::ns::DEFAULT_NS)
            && matches!(element.attr("type"), Some("result") | Some("error"))
          {
            match element.attr("id") {
              Some(id) => pending_iqs.lock().await.remove(id),
              None => None,
            }
          }
          else {
            None
          };

          if let Some(reply_tx) = reply_tx {
            match Iq::try_from(element) {
              Ok(iq) => {
                let _ = reply_tx.send(iq);
              },
              Err(e) => warn!("failed to parse iq reply: {:?}", e),
            }
            continue;
          }

          for handler in &locked_inner.stanza_handlers {
            if handler.wants(&element) {
              if let Err(e) = handler.handle(element).await {
                error!("handling stanza: {:?}", e);
              }
              break;
            }
          }
        },
      }
    }
  }
}
