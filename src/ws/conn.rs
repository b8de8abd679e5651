use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::mask::mask_bytes;
use super::{
    format_close_payload, is_valid_received_close_code, Error, Opcode, Role,
    CLOSE_MESSAGE_TOO_BIG, CLOSE_NO_STATUS_RECEIVED, CLOSE_PROTOCOL_ERROR, CONTROL_WRITE_WAIT,
    DEFAULT_READ_LIMIT, MAX_CONTROL_PAYLOAD_SIZE, MAX_FRAME_HEADER_SIZE, READ_BUFFER_SIZE,
    WRITE_BUFFER_SIZE,
};

const FINAL_BIT: u8 = 0x80;
const RSV1_BIT: u8 = 0x40;
const RSV2_BIT: u8 = 0x20;
const RSV3_BIT: u8 = 0x10;
const MASK_BIT: u8 = 0x80;

/// Object-safe alias for the byte streams a connection can run on.
pub(crate) trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

type BoxedStream = Box<dyn Stream>;

/// A complete, defragmented data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub opcode: Opcode,
    pub data: Vec<u8>,
}

impl Message {
    pub fn is_text(&self) -> bool {
        self.opcode == Opcode::Text
    }
}

/// A WebSocket connection over an owned byte stream.
///
/// Reads and writes are independently serialized. Read errors are permanent:
/// once `read_message` fails, every subsequent call returns the same error.
/// After a close frame has been sent, every write fails with
/// [`Error::CloseSent`].
pub struct WebSocket {
    reader: Mutex<FrameReader>,
    shared: Arc<WriteShared>,
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("role", &self.shared.role)
            .finish_non_exhaustive()
    }
}

impl WebSocket {
    pub fn new<S>(stream: S, role: Role) -> WebSocket
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: BoxedStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);
        let shared = Arc::new(WriteShared {
            role,
            writing: AtomicBool::new(false),
            write: Mutex::new(WriteHalfState {
                stream: write_half,
                scratch: BytesMut::with_capacity(WRITE_BUFFER_SIZE + MAX_FRAME_HEADER_SIZE),
                err: None,
            }),
        });
        WebSocket {
            reader: Mutex::new(FrameReader {
                stream: BufReader::with_capacity(READ_BUFFER_SIZE, read_half),
                control: Arc::clone(&shared),
                role,
                read_final: true,
                read_remaining: 0,
                read_length: 0,
                read_limit: DEFAULT_READ_LIMIT,
                read_mask: None,
                read_err: None,
            }),
            shared,
        }
    }

    /// Caps the total size of an inbound message. `0` disables the cap.
    pub async fn set_read_limit(&self, limit: u64) {
        self.reader.lock().await.read_limit = limit;
    }

    /// Reads the next data message, transparently answering pings and
    /// unmasking client frames. A close frame from the peer surfaces as
    /// [`Error::Closed`] after the close has been echoed.
    pub async fn read_message(&self) -> Result<Message, Error> {
        let mut reader = self.reader.lock().await;
        if let Some(err) = &reader.read_err {
            return Err(err.clone());
        }
        match reader.next_message().await {
            Ok(message) => Ok(message),
            Err(err) => {
                reader.read_err = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Writes one data message, fragmenting it according to the write buffer
    /// size. The frame-writer token is held for the whole message, so frames
    /// of two messages never interleave.
    pub async fn write_message(&self, opcode: Opcode, payload: &[u8]) -> Result<(), Error> {
        if !opcode.is_data() {
            return Err(Error::Protocol(format!("write of non-data opcode {opcode:?}")));
        }
        let mut state = self.shared.write.lock().await;
        if let Some(err) = &state.err {
            return Err(err.clone());
        }

        // Oversized payloads go out as a single unbuffered frame followed by
        // an empty final continuation.
        if payload.len() > 2 * WRITE_BUFFER_SIZE {
            self.shared.write_frame(&mut state, opcode, false, payload).await?;
            return self
                .shared
                .write_frame(&mut state, Opcode::Continuation, true, &[])
                .await;
        }

        let mut opcode = opcode;
        let mut rest = payload;
        while rest.len() > WRITE_BUFFER_SIZE {
            let (chunk, tail) = rest.split_at(WRITE_BUFFER_SIZE);
            self.shared.write_frame(&mut state, opcode, false, chunk).await?;
            opcode = Opcode::Continuation;
            rest = tail;
        }
        self.shared.write_frame(&mut state, opcode, true, rest).await
    }

    /// Writes a control frame, waiting for the writer token and the I/O up
    /// to `deadline`. `None` blocks until the token is available. Sending a
    /// close frame poisons the write path with [`Error::CloseSent`].
    pub async fn write_control(
        &self,
        opcode: Opcode,
        payload: &[u8],
        deadline: Option<Instant>,
    ) -> Result<(), Error> {
        if !opcode.is_control() {
            return Err(Error::Protocol(format!("control write of data opcode {opcode:?}")));
        }
        if payload.len() > MAX_CONTROL_PAYLOAD_SIZE {
            return Err(Error::InvalidControlFrame);
        }
        self.shared.write_control_frame(opcode, payload, deadline).await
    }

    /// Best-effort graceful close: a close frame with the given code and
    /// reason, bounded by the control write grace period.
    pub async fn send_close(&self, code: u16, reason: &str) -> Result<(), Error> {
        let deadline = Instant::now() + CONTROL_WRITE_WAIT;
        self.write_control(Opcode::Close, &format_close_payload(code, reason), Some(deadline))
            .await
    }
}

struct WriteShared {
    role: Role,
    /// Sentinel for concurrent frame writes. The write mutex already makes a
    /// violation impossible through this API; the swap is an assertion for
    /// the invariant the rest of the design relies on, and a true violation
    /// aborts the process.
    writing: AtomicBool,
    write: Mutex<WriteHalfState>,
}

struct WriteHalfState {
    stream: WriteHalf<BoxedStream>,
    scratch: BytesMut,
    err: Option<Error>,
}

impl WriteShared {
    async fn write_control_frame(
        &self,
        opcode: Opcode,
        payload: &[u8],
        deadline: Option<Instant>,
    ) -> Result<(), Error> {
        let mut state = match deadline {
            None => self.write.lock().await,
            Some(deadline) => {
                if deadline <= Instant::now() {
                    return Err(Error::WriteTimeout);
                }
                match tokio::time::timeout_at(deadline, self.write.lock()).await {
                    Ok(state) => state,
                    Err(_) => return Err(Error::WriteTimeout),
                }
            }
        };
        if let Some(err) = &state.err {
            return Err(err.clone());
        }
        match deadline {
            None => self.write_frame(&mut state, opcode, true, payload).await,
            Some(deadline) => {
                match tokio::time::timeout_at(deadline, self.write_frame(&mut state, opcode, true, payload))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        // The frame may be half-written; the stream is no
                        // longer usable.
                        state.err = Some(Error::WriteTimeout);
                        Err(Error::WriteTimeout)
                    }
                }
            }
        }
    }

    async fn write_frame(
        &self,
        state: &mut WriteHalfState,
        opcode: Opcode,
        fin: bool,
        payload: &[u8],
    ) -> Result<(), Error> {
        if opcode.is_control() && (!fin || payload.len() > MAX_CONTROL_PAYLOAD_SIZE) {
            return Err(Error::InvalidControlFrame);
        }

        let WriteHalfState { stream, scratch, err } = state;
        scratch.clear();
        scratch.reserve(MAX_FRAME_HEADER_SIZE + payload.len());

        let mut b0 = opcode as u8;
        if fin {
            b0 |= FINAL_BIT;
        }
        scratch.put_u8(b0);

        let mask_flag = if self.role == Role::Client { MASK_BIT } else { 0 };
        match payload.len() {
            len @ 0..=125 => scratch.put_u8(mask_flag | len as u8),
            len @ 126..=65535 => {
                scratch.put_u8(mask_flag | 126);
                scratch.put_u16(len as u16);
            }
            len => {
                scratch.put_u8(mask_flag | 127);
                scratch.put_u64(len as u64);
            }
        }

        if self.role == Role::Client {
            let key: [u8; 4] = rand::random();
            scratch.put_slice(&key);
            let start = scratch.len();
            scratch.put_slice(payload);
            mask_bytes(key, 0, &mut scratch[start..]);
        } else {
            scratch.put_slice(payload);
        }

        if self
            .writing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            panic!("concurrent write to websocket connection");
        }
        let result = async {
            stream.write_all(&scratch[..]).await?;
            stream.flush().await
        }
        .await;
        if !self.writing.swap(false, Ordering::Release) {
            panic!("concurrent write to websocket connection");
        }

        match result {
            Ok(()) => {
                if opcode == Opcode::Close {
                    *err = Some(Error::CloseSent);
                }
                Ok(())
            }
            Err(io_err) => {
                let failed = Error::from(io_err);
                *err = Some(failed.clone());
                Err(failed)
            }
        }
    }
}

struct FrameReader {
    stream: BufReader<ReadHalf<BoxedStream>>,
    /// Write path handle for best-effort close frames and pong replies.
    control: Arc<WriteShared>,
    role: Role,
    /// FIN seen on the frame that ends the current message. Starts true so
    /// the first frame of a message must be text or binary.
    read_final: bool,
    /// Payload bytes left in the current frame.
    read_remaining: u64,
    /// Cumulative payload bytes of the current message.
    read_length: u64,
    /// Maximum message size; 0 means unlimited.
    read_limit: u64,
    read_mask: Option<[u8; 4]>,
    read_err: Option<Error>,
}

impl FrameReader {
    async fn next_message(&mut self) -> Result<Message, Error> {
        self.read_length = 0;
        let mut opcode = None;
        let mut data = Vec::new();

        loop {
            let frame = match self.advance_frame().await? {
                Some(frame) => frame,
                // A handled control frame; keep going.
                None => continue,
            };
            if opcode.is_none() && frame != Opcode::Continuation {
                opcode = Some(frame);
            }

            let payload = self.read_frame_payload().await?;
            data.extend_from_slice(&payload);

            if self.read_final {
                break;
            }
        }

        match opcode {
            Some(opcode) => Ok(Message { opcode, data }),
            // Unreachable: the state machine rejects a leading continuation.
            None => Err(Error::Protocol("message without an initial frame".to_owned())),
        }
    }

    /// Advances past the next frame header. Returns the opcode of a data or
    /// continuation frame whose payload is now pending, or `None` when a
    /// control frame was fully consumed and handled.
    async fn advance_frame(&mut self) -> Result<Option<Opcode>, Error> {
        // Skip any unread remainder of the previous frame.
        if self.read_remaining > 0 {
            let remaining = self.read_remaining;
            self.discard(remaining).await?;
            self.read_remaining = 0;
        }

        // Parse the first two header bytes, collecting every error before
        // failing to aid debugging.
        let mut header = [0u8; 2];
        self.stream.read_exact(&mut header).await?;

        let fin = header[0] & FINAL_BIT != 0;
        let masked = header[1] & MASK_BIT != 0;
        self.read_remaining = u64::from(header[1] & 0x7f);

        let mut errors: Vec<String> = Vec::new();
        if header[0] & RSV1_BIT != 0 {
            errors.push("RSV1 set".to_owned());
        }
        if header[0] & RSV2_BIT != 0 {
            errors.push("RSV2 set".to_owned());
        }
        if header[0] & RSV3_BIT != 0 {
            errors.push("RSV3 set".to_owned());
        }

        let opcode = Opcode::from_u8(header[0] & 0x0f);
        match opcode {
            Some(opcode) if opcode.is_control() => {
                if self.read_remaining > MAX_CONTROL_PAYLOAD_SIZE as u64 {
                    errors.push("len > 125 for control".to_owned());
                }
                if !fin {
                    errors.push("FIN not set on control".to_owned());
                }
            }
            Some(Opcode::Text) | Some(Opcode::Binary) => {
                if !self.read_final {
                    errors.push("data before FIN".to_owned());
                }
                self.read_final = fin;
            }
            Some(Opcode::Continuation) => {
                if self.read_final {
                    errors.push("continuation after FIN".to_owned());
                }
                self.read_final = fin;
            }
            Some(_) | None => {
                errors.push(format!("bad opcode {}", header[0] & 0x0f));
            }
        }

        // The peer must mask iff it is a client.
        let expect_mask = self.role == Role::Server;
        if masked != expect_mask {
            errors.push("bad MASK".to_owned());
        }

        if !errors.is_empty() {
            return Err(self.protocol_error(errors.join(", ")).await);
        }
        let opcode = match opcode {
            Some(opcode) => opcode,
            None => return Err(Error::Protocol("bad opcode".to_owned())),
        };

        // Extended payload lengths, big-endian per RFC 6455 section 5.2.
        match self.read_remaining {
            126 => {
                let mut ext = [0u8; 2];
                self.stream.read_exact(&mut ext).await?;
                self.read_remaining = u64::from(u16::from_be_bytes(ext));
            }
            127 => {
                let mut ext = [0u8; 8];
                self.stream.read_exact(&mut ext).await?;
                self.read_remaining = u64::from_be_bytes(ext);
            }
            _ => {}
        }

        self.read_mask = if masked {
            let mut key = [0u8; 4];
            self.stream.read_exact(&mut key).await?;
            Some(key)
        } else {
            None
        };

        if !opcode.is_control() {
            let (length, overflowed) = self.read_length.overflowing_add(self.read_remaining);
            if overflowed {
                return Err(Error::ReadLimit);
            }
            self.read_length = length;
            if self.read_limit > 0 && self.read_length > self.read_limit {
                let _ = self
                    .control
                    .write_control_frame(
                        Opcode::Close,
                        &format_close_payload(CLOSE_MESSAGE_TOO_BIG, ""),
                        Some(Instant::now() + CONTROL_WRITE_WAIT),
                    )
                    .await;
                return Err(Error::ReadLimit);
            }
            return Ok(Some(opcode));
        }

        // Control frames: consume and unmask the payload, then dispatch.
        let mut payload = vec![0u8; self.read_remaining as usize];
        self.read_remaining = 0;
        self.stream.read_exact(&mut payload).await?;
        if let Some(key) = self.read_mask {
            mask_bytes(key, 0, &mut payload);
        }

        match opcode {
            Opcode::Ping => {
                match self
                    .control
                    .write_control_frame(
                        Opcode::Pong,
                        &payload,
                        Some(Instant::now() + CONTROL_WRITE_WAIT),
                    )
                    .await
                {
                    Ok(()) | Err(Error::CloseSent) | Err(Error::WriteTimeout) => {}
                    Err(err) => return Err(err),
                }
            }
            Opcode::Pong => {}
            _ => {
                let mut code = CLOSE_NO_STATUS_RECEIVED;
                let mut reason = String::new();
                if payload.len() >= 2 {
                    code = u16::from_be_bytes([payload[0], payload[1]]);
                    if !is_valid_received_close_code(code) {
                        return Err(self.protocol_error(format!("bad close code {code}")).await);
                    }
                    reason = match std::str::from_utf8(&payload[2..]) {
                        Ok(reason) => reason.to_owned(),
                        Err(_) => {
                            return Err(self
                                .protocol_error("invalid utf8 payload in close frame".to_owned())
                                .await)
                        }
                    };
                }
                // Echo the close before surfacing it.
                let _ = self
                    .control
                    .write_control_frame(
                        Opcode::Close,
                        &format_close_payload(
                            if code == CLOSE_NO_STATUS_RECEIVED { super::CLOSE_NORMAL_CLOSURE } else { code },
                            "",
                        ),
                        Some(Instant::now() + CONTROL_WRITE_WAIT),
                    )
                    .await;
                return Err(Error::Closed { code, reason });
            }
        }

        Ok(None)
    }

    async fn read_frame_payload(&mut self) -> Result<Vec<u8>, Error> {
        let mut payload = vec![0u8; self.read_remaining as usize];
        self.read_remaining = 0;
        self.stream.read_exact(&mut payload).await?;
        if let Some(key) = self.read_mask {
            mask_bytes(key, 0, &mut payload);
        }
        Ok(payload)
    }

    async fn discard(&mut self, mut remaining: u64) -> Result<(), Error> {
        let mut scratch = [0u8; 512];
        while remaining > 0 {
            let chunk = remaining.min(scratch.len() as u64) as usize;
            self.stream.read_exact(&mut scratch[..chunk]).await?;
            remaining -= chunk as u64;
        }
        Ok(())
    }

    /// Best-effort `Close(1002)` carrying the error message (truncated to
    /// the control frame limit), then the protocol error itself.
    async fn protocol_error(&mut self, message: String) -> Error {
        let mut payload = format_close_payload(CLOSE_PROTOCOL_ERROR, &message);
        payload.truncate(MAX_CONTROL_PAYLOAD_SIZE);
        let _ = self
            .control
            .write_control_frame(Opcode::Close, &payload, Some(Instant::now() + CONTROL_WRITE_WAIT))
            .await;
        Error::Protocol(message)
    }
}
