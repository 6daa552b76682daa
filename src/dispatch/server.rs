//! UDP front-end for the dispatch protocol.
//!
//! Owns the socket, decodes OSC packets and forwards them to the audio
//! thread over the bounded control channel. Performance messages
//! (`/note_on`, `/cc`, ...) are translated to typed [`ControlMessage`]s;
//! everything else rides through as a dispatch call for the compiled path
//! table, and replies come back on the reply channel to the most recent
//! sender.

use crate::constants::OSC_RECV_BUFFER_SIZE;
use crate::rt_warn;
use crate::types::{ControlMessage, EngineError};
use crossbeam_channel::Sender;
use crossbeam_queue::ArrayQueue;
use rosc::{OscMessage, OscPacket, OscType};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct DispatchServer {
    socket: UdpSocket,
    control_tx: Sender<ControlMessage>,
    reply_queue: Arc<ArrayQueue<OscMessage>>,
    shutdown: Arc<AtomicBool>,
    dropped_events: Arc<AtomicU64>,
    recv_buffer: [u8; OSC_RECV_BUFFER_SIZE],
    last_sender: Option<SocketAddr>,
}

impl DispatchServer {
    pub fn new(
        host: &str,
        port: u16,
        control_tx: Sender<ControlMessage>,
        reply_queue: Arc<ArrayQueue<OscMessage>>,
        shutdown: Arc<AtomicBool>,
        dropped_events: Arc<AtomicU64>,
    ) -> Result<Self, EngineError> {
        let addr = format!("{}:{}", host, port);
        let socket = UdpSocket::bind(&addr)
            .map_err(|e| EngineError::BindFailed { addr: addr.clone(), reason: e.to_string() })?;
        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .map_err(|e| EngineError::BindFailed { addr, reason: e.to_string() })?;

        Ok(Self {
            socket,
            control_tx,
            reply_queue,
            shutdown,
            dropped_events,
            recv_buffer: [0u8; OSC_RECV_BUFFER_SIZE],
            last_sender: None,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    /// Serves until the shutdown flag goes up.
    pub fn run(&mut self) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            self.flush_replies();

            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, sender)) => {
                    self.last_sender = Some(sender);
                    let data = &self.recv_buffer[..size];
                    match rosc::decoder::decode_udp(data) {
                        Ok((_, packet)) => self.handle_packet(packet),
                        Err(_) => rt_warn!("[dispatch] undecodable packet ({} bytes)", size),
                    }
                }
                Err(err) => {
                    if !matches!(
                        err.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                    ) {
                        rt_warn!("[dispatch] receive failed: {}", err);
                    }
                }
            }
        }
    }

    fn handle_packet(&mut self, packet: OscPacket) {
        match packet {
            OscPacket::Message(message) => self.forward(message),
            OscPacket::Bundle(bundle) => {
                for inner in bundle.content {
                    self.handle_packet(inner);
                }
            }
        }
    }

    /// Translates performance paths into typed messages; everything else
    /// goes to the path table.
    fn forward(&mut self, message: OscMessage) {
        let translated = match message.addr.as_str() {
            "/note_on" => match (int_arg(&message.args, 0), float_arg(&message.args, 1)) {
                (Some(note), Some(velocity)) => Some(ControlMessage::NoteOn {
                    delay: 0,
                    note: note.clamp(0, 127) as u8,
                    velocity,
                }),
                _ => None,
            },
            "/note_off" => match (int_arg(&message.args, 0), float_arg(&message.args, 1)) {
                (Some(note), Some(velocity)) => Some(ControlMessage::NoteOff {
                    delay: 0,
                    note: note.clamp(0, 127) as u8,
                    velocity,
                }),
                _ => None,
            },
            "/cc" => match (int_arg(&message.args, 0), float_arg(&message.args, 1)) {
                (Some(cc), Some(value)) => {
                    Some(ControlMessage::Cc { delay: 0, cc: cc.clamp(0, 143) as u16, value })
                }
                _ => None,
            },
            "/tempo" => float_arg(&message.args, 0).map(ControlMessage::Tempo),
            "/all_sound_off" => Some(ControlMessage::AllSoundOff),
            "/panic" => Some(ControlMessage::Panic),
            _ => Some(ControlMessage::Dispatch(message.clone())),
        };

        let Some(control) = translated else {
            rt_warn!("[dispatch] malformed arguments for {}", message.addr);
            return;
        };

        if self.control_tx.try_send(control).is_err() {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            rt_warn!("[dispatch] control queue full, dropping message");
        }
    }

    fn flush_replies(&mut self) {
        while let Some(reply) = self.reply_queue.pop() {
            let Some(addr) = self.last_sender else {
                continue;
            };
            let packet = OscPacket::Message(reply);
            if let Ok(bytes) = rosc::encoder::encode(&packet) {
                let _ = self.socket.send_to(&bytes, addr);
            }
        }
    }
}

fn int_arg(args: &[OscType], index: usize) -> Option<i32> {
    match args.get(index)? {
        OscType::Int(i) => Some(*i),
        OscType::Long(l) => Some(*l as i32),
        OscType::Float(f) => Some(*f as i32),
        _ => None,
    }
}

fn float_arg(args: &[OscType], index: usize) -> Option<f32> {
    match args.get(index)? {
        OscType::Float(f) => Some(*f),
        OscType::Double(d) => Some(*d as f32),
        OscType::Int(i) => Some(*i as f32),
        _ => None,
    }
}
