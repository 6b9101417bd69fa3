use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::protocol::{Frame, MAX_FRAME_SIZE};

/// Outbound/inbound channel capacity per connection.
const CHANNEL_CAPACITY: usize = 256;

/// One open link. The engine owns this handle exclusively: frames go out
/// through `outbound`, inbound items are either a decoded frame or a
/// recoverable codec error; the channel closing means the link is down.
pub struct TransportConn {
	pub outbound: mpsc::Sender<Frame>,
	pub inbound: mpsc::Receiver<Result<Frame, TransportError>>,
}

/// A dialable transport. Implementations own the socket details; the engine
/// only sees channel pairs, so transports are swappable (TCP, in-process,
/// test doubles).
#[async_trait]
pub trait Transport: Send {
	async fn open(&mut self) -> Result<TransportConn, TransportError>;
}

/// TCP transport carrying 4-byte big-endian length-prefixed JSON frames.
pub struct TcpTransport {
	addr: String,
}

impl TcpTransport {
	pub fn new(addr: impl Into<String>) -> Self {
		Self { addr: addr.into() }
	}
}

#[async_trait]
impl Transport for TcpTransport {
	async fn open(&mut self) -> Result<TransportConn, TransportError> {
		debug!("connecting to {}", self.addr);
		let stream = TcpStream::connect(&self.addr).await?;
		stream.set_nodelay(true)?;
		info!("connection established with {}", self.addr);

		let (mut read_half, mut write_half) = stream.into_split();
		let (out_tx, mut out_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);
		let (in_tx, in_rx) = mpsc::channel::<Result<Frame, TransportError>>(CHANNEL_CAPACITY);

		tokio::spawn(async move {
			while let Some(frame) = out_rx.recv().await {
				if let Err(e) = write_frame(&mut write_half, &frame).await {
					warn!("transport write failed: {}", e);
					break;
				}
			}
		});

		tokio::spawn(async move {
			loop {
				match read_frame(&mut read_half).await {
					Ok(frame) => {
						if in_tx.send(Ok(frame)).await.is_err() {
							break;
						}
					}
					// Codec errors are recoverable: report and keep reading.
					Err(e @ TransportError::Codec(_)) => {
						if in_tx.send(Err(e)).await.is_err() {
							break;
						}
					}
					Err(e) => {
						debug!("transport read loop ended: {}", e);
						break;
					}
				}
			}
			// in_tx drops here; the engine observes the link as closed.
		});

		Ok(TransportConn {
			outbound: out_tx,
			inbound: in_rx,
		})
	}
}

/// Write one length-prefixed frame.
async fn write_frame<W: AsyncWriteExt + Unpin>(
	writer: &mut W,
	frame: &Frame,
) -> Result<(), TransportError> {
	let json = serde_json::to_vec(frame)?;
	let len = json.len();
	if len > MAX_FRAME_SIZE {
		return Err(TransportError::FrameTooLarge {
			size: len,
			max: MAX_FRAME_SIZE,
		});
	}

	writer.write_all(&(len as u32).to_be_bytes()).await?;
	writer.write_all(&json).await?;
	writer.flush().await?;
	Ok(())
}

/// Read one length-prefixed frame.
async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Frame, TransportError> {
	let mut len_bytes = [0u8; 4];
	reader.read_exact(&mut len_bytes).await?;

	let len = u32::from_be_bytes(len_bytes) as usize;
	if len > MAX_FRAME_SIZE {
		return Err(TransportError::FrameTooLarge {
			size: len,
			max: MAX_FRAME_SIZE,
		});
	}

	let mut buf = vec![0u8; len];
	reader.read_exact(&mut buf).await?;

	let frame: Frame = serde_json::from_slice(&buf)?;
	Ok(frame)
}

/// In-process transport for tests and demos: every `open` yields a channel
/// pair whose server side pops out of the paired [`memory::MemoryListener`].
pub mod memory {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicU32, Ordering};

	use super::*;

	/// Create a connected transport/listener pair.
	pub fn pair() -> (MemoryTransport, MemoryListener) {
		let (accept_tx, accept_rx) = mpsc::unbounded_channel();
		let transport = MemoryTransport {
			accepts: accept_tx,
			fail_opens: Arc::new(AtomicU32::new(0)),
			open_attempts: Arc::new(AtomicU32::new(0)),
		};
		let listener = MemoryListener { accepts: accept_rx };
		(transport, listener)
	}

	pub struct MemoryTransport {
		accepts: mpsc::UnboundedSender<ServerConn>,
		fail_opens: Arc<AtomicU32>,
		open_attempts: Arc<AtomicU32>,
	}

	impl MemoryTransport {
		/// Make the next `n` opens fail, to exercise reconnect backoff.
		pub fn fail_next_opens(&self, n: u32) {
			self.fail_opens.store(n, Ordering::Relaxed);
		}

		/// Total opens attempted so far (failed ones included).
		pub fn open_attempts(&self) -> u32 {
			self.open_attempts.load(Ordering::Relaxed)
		}

		/// Clonable counters, usable after the transport moves into the engine.
		pub fn probes(&self) -> MemoryProbes {
			MemoryProbes {
				fail_opens: self.fail_opens.clone(),
				open_attempts: self.open_attempts.clone(),
			}
		}
	}

	/// Shared counters split out of a [`MemoryTransport`].
	#[derive(Clone)]
	pub struct MemoryProbes {
		fail_opens: Arc<AtomicU32>,
		open_attempts: Arc<AtomicU32>,
	}

	impl MemoryProbes {
		pub fn fail_next_opens(&self, n: u32) {
			self.fail_opens.store(n, Ordering::Relaxed);
		}

		pub fn open_attempts(&self) -> u32 {
			self.open_attempts.load(Ordering::Relaxed)
		}
	}

	#[async_trait]
	impl Transport for MemoryTransport {
		async fn open(&mut self) -> Result<TransportConn, TransportError> {
			self.open_attempts.fetch_add(1, Ordering::Relaxed);

			let remaining = self.fail_opens.load(Ordering::Relaxed);
			if remaining > 0 {
				self.fail_opens.store(remaining - 1, Ordering::Relaxed);
				return Err(TransportError::Closed);
			}

			let (out_tx, out_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);
			let (in_tx, in_rx) =
				mpsc::channel::<Result<Frame, TransportError>>(CHANNEL_CAPACITY);

			let server = ServerConn {
				from_client: out_rx,
				to_client: in_tx,
			};
			self.accepts
				.send(server)
				.map_err(|_| TransportError::Closed)?;

			Ok(TransportConn {
				outbound: out_tx,
				inbound: in_rx,
			})
		}
	}

	pub struct MemoryListener {
		accepts: mpsc::UnboundedReceiver<ServerConn>,
	}

	impl MemoryListener {
		/// Wait for the client's next successful open.
		pub async fn accept(&mut self) -> Option<ServerConn> {
			self.accepts.recv().await
		}
	}

	/// Server-side half of an in-process link.
	pub struct ServerConn {
		pub from_client: mpsc::Receiver<Frame>,
		pub to_client: mpsc::Sender<Result<Frame, TransportError>>,
	}

	impl ServerConn {
		pub async fn recv(&mut self) -> Option<Frame> {
			self.from_client.recv().await
		}

		pub async fn send(&self, frame: Frame) -> bool {
			self.to_client.send(Ok(frame)).await.is_ok()
		}

		/// Inject a recoverable decode error, as a malformed wire frame would.
		pub async fn send_garbage(&self) -> bool {
			let codec_err = serde_json::from_str::<Frame>("{").unwrap_err();
			self.to_client
				.send(Err(TransportError::Codec(codec_err)))
				.await
				.is_ok()
		}
	}
}
