//! RFCOMM stream handling for serial port peers.
//!
//! A [`Link`] owns one connected stream split into a reader task, which
//! frames inbound bytes and fans them out to subscribers, and a writer task
//! fed through a command channel.

use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use bluer::{
   Address,
   rfcomm::{
      SocketAddr, Stream,
      stream::{OwnedReadHalf, OwnedWriteHalf},
   },
};
use log::{debug, warn};
use smol_str::SmolStr;
use tokio::{
   io::{AsyncReadExt, AsyncWriteExt},
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use crate::{
   bluetooth::{
      subscription::{Callback, Listeners, Subscription},
      transport::{Inbound, LinkConfig, MAX_DELIMITER_LEN, Payload},
   },
   error::{LinkError, Result},
};

/// Largest frame buffered while waiting for a delimiter
pub const MAX_FRAME_LEN: usize = 4096;
/// Size of one socket read
const READ_CHUNK: usize = 1024;
/// Timeout for write operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

enum Command {
   Send {
      data: Vec<u8>,
      then: oneshot::Sender<Result<()>>,
   },
}

/// Splits a byte stream into delimiter-terminated frames.
///
/// Frames keep their delimiter. With an empty delimiter every chunk is passed
/// through as-is.
#[derive(Debug)]
pub struct Framer {
   delimiter: heapless::Vec<u8, MAX_DELIMITER_LEN>,
   buf: Vec<u8>,
}

impl Framer {
   pub fn new(config: &LinkConfig) -> Self {
      Self {
         delimiter: config.delimiter.clone(),
         buf: Vec::new(),
      }
   }

   pub fn push(&mut self, bytes: &[u8], mut emit: impl FnMut(Payload)) {
      if self.delimiter.is_empty() {
         if !bytes.is_empty() {
            emit(Payload::from_slice(bytes));
         }
         return;
      }

      // A delimiter may straddle the previous chunk.
      let mut from = self.buf.len().saturating_sub(self.delimiter.len() - 1);
      self.buf.extend_from_slice(bytes);

      while let Some(pos) = self.buf[from..]
         .windows(self.delimiter.len())
         .position(|w| w == self.delimiter.as_slice())
      {
         let end = from + pos + self.delimiter.len();
         emit(Payload::from_slice(&self.buf[..end]));
         self.buf.drain(..end);
         from = 0;
      }

      if self.buf.len() >= MAX_FRAME_LEN {
         warn!("No delimiter within {MAX_FRAME_LEN} bytes, flushing partial frame");
         emit(Payload::from_slice(&self.buf));
         self.buf.clear();
      }
   }

   /// Bytes held back waiting for a delimiter.
   pub fn pending(&self) -> usize {
      self.buf.len()
   }
}

/// Sending half of a link. Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct LinkSender {
   tx: mpsc::Sender<Command>,
}

impl LinkSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   pub async fn send(&self, data: &[u8]) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Command::Send {
            data: data.to_vec(),
            then: tx,
         })
         .await
         .map_err(|_| LinkError::NotConnected)?;

      time::timeout(WRITE_TIMEOUT, rx)
         .await
         .map_err(|_| LinkError::WriteFailed("timed out".to_string()))?
         .map_err(|_| LinkError::NotConnected)?
   }
}

/// Fan-out point for inbound traffic of one link.
///
/// Once closed it refuses new subscribers. A subscriber admitted before the
/// close always receives [`Inbound::Closed`].
#[derive(Default)]
struct Inlet {
   listeners: Listeners<Inbound>,
   closed: AtomicBool,
}

impl Inlet {
   fn subscribe(&self, cb: Callback<Inbound>) -> Result<Subscription> {
      let handle = self.listeners.install(cb);
      if self.is_closed() {
         handle.remove();
         return Err(LinkError::NotConnected);
      }
      Ok(handle)
   }

   fn emit(&self, frame: Payload) {
      self.listeners.emit(Inbound::Frame(frame));
   }

   fn close(&self, reason: SmolStr) {
      self.closed.store(true, Ordering::SeqCst);
      self.listeners.emit(Inbound::Closed(reason));
   }

   fn is_closed(&self) -> bool {
      self.closed.load(Ordering::SeqCst)
   }
}

/// One open RFCOMM connection. Dropping it aborts both tasks and closes the socket.
pub struct Link {
   sender: LinkSender,
   inlet: Arc<Inlet>,
   _tasks: JoinSet<()>,
}

impl Link {
   pub async fn connect(address: Address, config: &LinkConfig, timeout: Duration) -> Result<Self> {
      let addr = SocketAddr::new(address, config.channel);
      debug!("Connecting to {address} on RFCOMM channel {}", config.channel);

      let stream = time::timeout(timeout, Stream::connect(addr))
         .await
         .map_err(|_| LinkError::ConnectFailed(format!("timed out after {timeout:?}")))?
         .map_err(|e| LinkError::ConnectFailed(e.to_string()))?;
      let (reader, writer) = stream.into_split();

      let (cmd_tx, cmd_rx) = mpsc::channel(128);
      let inlet = Arc::new(Inlet::default());

      let mut tasks = JoinSet::new();
      tasks.spawn(recv_thread(address, reader, Framer::new(config), inlet.clone()));
      tasks.spawn(send_thread(address, cmd_rx, writer));

      Ok(Self {
         sender: LinkSender { tx: cmd_tx },
         inlet,
         _tasks: tasks,
      })
   }

   pub fn is_connected(&self) -> bool {
      !self.inlet.is_closed() && self.sender.is_connected()
   }

   pub fn sender(&self) -> LinkSender {
      self.sender.clone()
   }

   /// Fails with `NotConnected` once the reader has seen the link close.
   pub fn subscribe(&self, cb: Callback<Inbound>) -> Result<Subscription> {
      self.inlet.subscribe(cb)
   }
}

async fn recv_thread(
   adr: Address,
   mut reader: OwnedReadHalf,
   mut framer: Framer,
   inlet: Arc<Inlet>,
) {
   let mut stack = [0u8; READ_CHUNK];
   let reason: SmolStr = loop {
      match reader.read(&mut stack).await {
         Ok(0) => break "connection closed by peer".into(),
         Ok(n) => {
            let recvd = &stack[..n];
            debug!("← {adr}: {}", hex::encode(recvd));
            framer.push(recvd, |frame| inlet.emit(frame));
         },
         Err(e) => break e.to_string().into(),
      }
   };

   warn!("Connection to {adr} lost: {reason}");
   if framer.pending() > 0 {
      debug!("Dropping {} unterminated byte(s) from {adr}", framer.pending());
   }
   inlet.close(reason);
}

async fn send_thread(adr: Address, mut rx: mpsc::Receiver<Command>, mut writer: OwnedWriteHalf) {
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {adr}: {}", hex::encode(&data));
            let res = match writer.write_all(&data).await {
               Ok(()) => writer.flush().await,
               Err(e) => Err(e),
            };
            if let Err(e) = res {
               warn!("Failed to send data: {e}");
               let _ = then.send(Err(LinkError::WriteFailed(e.to_string())));
            } else {
               _ = then.send(Ok(()));
            }
         },
      }
   }
   debug!("Writer for {adr} shut down");
}
