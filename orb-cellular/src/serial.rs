//! AT channel over the modem's serial port.
//!
//! A reader task decodes the byte stream into lines and routes each of them
//! either to the command waiting for its result or, when unsolicited, into the
//! service mailbox.

use crate::{
    at::{AtChannel, AtResult, Cmd, Code, urc::Urc},
    service::Event,
};
use async_trait::async_trait;
use bytes::{Buf as _, BytesMut};
use color_eyre::{
    Result,
    eyre::{WrapErr as _, eyre},
};
use futures::StreamExt as _;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt as _, WriteHalf},
    task::JoinHandle,
    time,
};
use tokio_serial::{SerialPortBuilderExt as _, SerialStream};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, trace, warn};

const MAX_LINE_LEN: usize = 4096;
const CTRL_Z: u8 = 0x1a;
const ESC: u8 = 0x1b;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    /// `> ` sent by the modem when it waits for an SMS payload.
    Prompt,
}

/// Splits modem output on CR/LF. The SMS prompt has no line terminator and is
/// yielded as soon as it shows up at the start of a line.
#[derive(Debug, Default)]
pub struct AtCodec;

impl Decoder for AtCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        loop {
            let blank = src
                .iter()
                .take_while(|b| matches!(b, b'\r' | b'\n'))
                .count();
            src.advance(blank);

            match src.first() {
                None => return Ok(None),
                Some(b'>') => {
                    let len = if src.get(1) == Some(&b' ') { 2 } else { 1 };
                    src.advance(len);
                    return Ok(Some(Frame::Prompt));
                }
                Some(_) => {}
            }

            let Some(end) = src.iter().position(|b| matches!(b, b'\r' | b'\n')) else {
                if src.len() > MAX_LINE_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("modem line exceeds {MAX_LINE_LEN} bytes"),
                    ));
                }
                return Ok(None);
            };

            let line = src.split_to(end);
            let line = String::from_utf8_lossy(&line).trim().to_string();
            if !line.is_empty() {
                return Ok(Some(Frame::Line(line)));
            }
        }
    }
}

/// What the channel is waiting for, shared with the reader task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromPrimitive)]
enum Pending {
    #[default]
    Nothing = 0,
    Command = 1,
    /// `ATD`/`ATA`, whose final line may be `NO CARRIER`, `BUSY` or `NO ANSWER`.
    CallSetup = 2,
}

impl Pending {
    fn of(cmd: &Cmd) -> Self {
        if ["ATD", "ATA"].iter().any(|p| cmd.text().starts_with(p)) {
            Self::CallSetup
        } else {
            Self::Command
        }
    }

    fn load(shared: &AtomicU8) -> Self {
        Self::from_u8(shared.load(Ordering::Acquire)).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Response,
    Mailbox,
    Discard,
}

fn route(frame: &Frame, pending: Pending) -> Route {
    match frame {
        Frame::Line(line) if Urc::is_unsolicited(line) => Route::Mailbox,
        Frame::Line(line) if Urc::is_call_abort(line) && pending != Pending::CallSetup => {
            Route::Mailbox
        }
        _ if pending != Pending::Nothing => Route::Response,
        Frame::Line(_) => Route::Mailbox,
        Frame::Prompt => Route::Discard,
    }
}

async fn read_frames<R>(
    reader: R,
    pending: Arc<AtomicU8>,
    responses: flume::Sender<Frame>,
    mailbox: flume::Sender<Event>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, AtCodec);
    while let Some(frame) = frames.next().await {
        let frame = frame.wrap_err("failed to read from modem")?;
        trace!("<- {frame:?}");
        match (route(&frame, Pending::load(&pending)), frame) {
            (Route::Response, frame) => {
                if responses.send(frame).is_err() {
                    debug!("AT channel dropped, stopping modem reader");
                    return Ok(());
                }
            }
            (Route::Mailbox, Frame::Line(line)) => {
                if mailbox.send_async(Event::Urc(line)).await.is_err() {
                    debug!("service mailbox closed, stopping modem reader");
                    return Ok(());
                }
            }
            (_, frame) => debug!("discarding stray {frame:?}"),
        }
    }

    Err(eyre!("modem closed the serial port"))
}

pub struct SerialChannel<W = WriteHalf<SerialStream>> {
    writer: W,
    responses: flume::Receiver<Frame>,
    pending: Arc<AtomicU8>,
}

impl SerialChannel {
    /// Opens `device` and spawns the reader task. Unsolicited lines are posted to
    /// `mailbox`.
    pub fn open(
        device: &str,
        baud_rate: u32,
        mailbox: flume::Sender<Event>,
    ) -> Result<(Self, JoinHandle<Result<()>>)> {
        let serial = tokio_serial::new(device, baud_rate)
            .open_native_async()
            .wrap_err_with(|| format!("failed to open serial port {device}"))?;
        let (reader, writer) = tokio::io::split(serial);

        Ok(Self::from_io(reader, writer, mailbox))
    }
}

impl<W> SerialChannel<W>
where
    W: AsyncWrite + Send + Unpin,
{
    pub fn from_io<R>(
        reader: R,
        writer: W,
        mailbox: flume::Sender<Event>,
    ) -> (Self, JoinHandle<Result<()>>)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let pending = Arc::new(AtomicU8::new(Pending::Nothing as u8));
        let (responses_tx, responses) = flume::unbounded();
        let task = tokio::spawn(read_frames(
            reader,
            Arc::clone(&pending),
            responses_tx,
            mailbox,
        ));

        (
            Self {
                writer,
                responses,
                pending,
            },
            task,
        )
    }

    async fn next_frame(&mut self) -> io::Result<Frame> {
        self.responses
            .recv_async()
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "modem reader stopped"))
    }

    /// Collects lines up to the final result line. Returns early on the prompt if
    /// `until_prompt` is set, `true` meaning the prompt was seen.
    async fn collect(&mut self, lines: &mut Vec<String>, until_prompt: bool) -> io::Result<bool> {
        loop {
            match self.next_frame().await? {
                Frame::Prompt if until_prompt => return Ok(true),
                Frame::Prompt => debug!("ignoring unexpected prompt"),
                Frame::Line(line) => {
                    let done = AtResult::is_final(&line);
                    lines.push(line);
                    if done {
                        return Ok(false);
                    }
                }
            }
        }
    }

    async fn transact(
        &mut self,
        cmd: &Cmd,
        payload: Option<&str>,
        lines: &mut Vec<String>,
    ) -> io::Result<()> {
        self.writer.write_all(format!("{cmd}\r").as_bytes()).await?;
        self.writer.flush().await?;

        if let Some(payload) = payload {
            if !self.collect(lines, true).await? {
                return Ok(());
            }
            self.writer.write_all(payload.as_bytes()).await?;
            self.writer.write_all(&[CTRL_Z]).await?;
            self.writer.flush().await?;
        }

        self.collect(lines, false).await.map(|_| ())
    }

    async fn exchange(&mut self, cmd: &Cmd, payload: Option<&str>) -> AtResult {
        for stale in self.responses.drain() {
            debug!("discarding stale {stale:?}");
        }

        debug!("-> {cmd}");
        self.pending
            .store(Pending::of(cmd) as u8, Ordering::Release);
        let mut lines = Vec::new();
        let outcome = time::timeout(cmd.timeout(), self.transact(cmd, payload, &mut lines)).await;
        self.pending
            .store(Pending::Nothing as u8, Ordering::Release);

        match outcome {
            Ok(Ok(())) => AtResult::from_lines(lines),
            Ok(Err(e)) => {
                warn!("failed to exchange `{cmd}` with modem: {e}");
                AtResult {
                    code: Code::Error,
                    response: lines,
                    ..Default::default()
                }
            }
            Err(_) => {
                warn!("`{cmd}` timed out after {:?}", cmd.timeout());
                if payload.is_some() {
                    self.writer.write_all(&[ESC]).await.ok();
                }
                AtResult::timeout(lines)
            }
        }
    }
}

#[async_trait]
impl<W> AtChannel for SerialChannel<W>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn cmd(&mut self, cmd: &Cmd) -> AtResult {
        self.exchange(cmd, None).await
    }

    async fn cmd_with_prompt(&mut self, cmd: &Cmd, payload: &str) -> AtResult {
        self.exchange(cmd, Some(payload)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};

    fn decode_all(input: &[u8]) -> Vec<Frame> {
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = AtCodec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn it_splits_lines_and_prompts() {
        let frames = decode_all(b"\r\n+CGATT: 1\r\n\r\nOK\r\n> ");

        assert_eq!(
            frames,
            vec![
                Frame::Line("+CGATT: 1".into()),
                Frame::Line("OK".into()),
                Frame::Prompt,
            ]
        );
    }

    #[test]
    fn it_waits_for_line_terminator() {
        let mut buf = BytesMut::from(&b"+CSQ: 2"[..]);

        assert_eq!(AtCodec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"0,99\r\n");
        assert_eq!(
            AtCodec.decode(&mut buf).unwrap(),
            Some(Frame::Line("+CSQ: 20,99".into()))
        );
    }

    #[test]
    fn it_rejects_runaway_lines() {
        let mut buf = BytesMut::from(&[b'a'; MAX_LINE_LEN + 1][..]);

        assert!(AtCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn it_routes_unsolicited_lines_to_mailbox() {
        let ring = Frame::Line("RING".into());
        let ok = Frame::Line("OK".into());

        assert_eq!(route(&ring, Pending::Command), Route::Mailbox);
        assert_eq!(route(&ok, Pending::Command), Route::Response);
        assert_eq!(route(&ok, Pending::Nothing), Route::Mailbox);
        assert_eq!(route(&Frame::Prompt, Pending::Command), Route::Response);
        assert_eq!(route(&Frame::Prompt, Pending::Nothing), Route::Discard);
    }

    #[test]
    fn it_routes_call_aborts_to_the_dial_only() {
        let no_carrier = Frame::Line("NO CARRIER".into());

        assert_eq!(route(&no_carrier, Pending::CallSetup), Route::Response);
        assert_eq!(route(&no_carrier, Pending::Command), Route::Mailbox);
        assert_eq!(route(&no_carrier, Pending::Nothing), Route::Mailbox);
        assert_eq!(Pending::of(&Cmd::new("ATD600700800;")), Pending::CallSetup);
        assert_eq!(Pending::of(&Cmd::new("AT+CLCC")), Pending::Command);
    }

    struct Modem {
        rx: DuplexStream,
        tx: DuplexStream,
    }

    impl Modem {
        async fn expect(&mut self, expected: &str) {
            let mut buf = vec![0; expected.len()];
            self.rx.read_exact(&mut buf).await.unwrap();
            assert_eq!(String::from_utf8_lossy(&buf), expected);
        }

        async fn reply(&mut self, output: &str) {
            self.tx.write_all(output.as_bytes()).await.unwrap();
        }
    }

    fn channel() -> (
        SerialChannel<DuplexStream>,
        Modem,
        flume::Receiver<Event>,
    ) {
        let (writer, modem_rx) = tokio::io::duplex(1024);
        let (modem_tx, reader) = tokio::io::duplex(1024);
        let (mailbox, events) = flume::unbounded();
        let (channel, _task) = SerialChannel::from_io(reader, writer, mailbox);

        (
            channel,
            Modem {
                rx: modem_rx,
                tx: modem_tx,
            },
            events,
        )
    }

    #[tokio::test]
    async fn it_runs_a_command_and_forwards_urcs() {
        let (mut channel, mut modem, events) = channel();

        let modem = tokio::spawn(async move {
            modem.expect("AT+CGATT?\r").await;
            modem.reply("\r\n+CGATT: 1\r\nRING\r\n\r\nOK\r\n").await;
            modem
        });
        let result = channel.cmd(&Cmd::new("AT+CGATT?")).await;
        let _modem = modem.await.unwrap();

        assert_eq!(result.code, Code::Ok);
        assert_eq!(result.response, vec!["+CGATT: 1", "OK"]);
        assert_eq!(events.recv_async().await.unwrap(), Event::Urc("RING".into()));
    }

    #[tokio::test]
    async fn it_writes_payload_after_prompt() {
        let (mut channel, mut modem, _events) = channel();

        let modem = tokio::spawn(async move {
            modem.expect("AT+CMGS=\"0036\"\r").await;
            modem.reply("\r\n> ").await;
            modem.expect("0048\u{1a}").await;
            modem.reply("\r\n+CMGS: 7\r\n\r\nOK\r\n").await;
        });
        let cmd = Cmd::new("AT+CMGS=\"0036\"").with_timeout(Duration::from_secs(5));
        let result = channel.cmd_with_prompt(&cmd, "0048").await;
        modem.await.unwrap();

        assert_eq!(result.code, Code::Ok);
    }

    #[tokio::test]
    async fn it_forwards_hang_up_during_call_poll() {
        let (mut channel, mut modem, events) = channel();

        let modem = tokio::spawn(async move {
            modem.expect("AT+CLCC\r").await;
            modem.reply("\r\nNO CARRIER\r\n\r\nOK\r\n").await;
            modem
        });
        let result = channel.cmd(&Cmd::new("AT+CLCC")).await;
        let _modem = modem.await.unwrap();

        assert_eq!(result.code, Code::Ok);
        assert_eq!(result.response, vec!["OK"]);
        assert_eq!(
            events.recv_async().await.unwrap(),
            Event::Urc("NO CARRIER".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn it_times_out_silent_commands() {
        let (mut channel, _modem, _events) = channel();

        let result = channel.cmd(&Cmd::new("AT")).await;

        assert_eq!(result.code, Code::Timeout);
    }
}
