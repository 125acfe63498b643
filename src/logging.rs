//! Logging backend which logs to a file and, in debug builds, over UDP.

use std::{
    any::Any,
    fs::File,
    io::Write,
    net,
    panic::PanicHookInfo,
    path::Path,
    sync::mpsc::{self, Sender},
};

use chrono::Local;
use log::{Level, LevelFilter, Metadata, Record};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::meta::settings::Options;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
enum MessageType {
    Normal,
    Error,
    Warning,
    Debug,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    module: String,
    msg_type: MessageType,
    string: String,
    time: String,
}

impl Message {
    fn from_record(record: &Record) -> Message {
        let msg_type = match record.level() {
            Level::Error => MessageType::Error,
            Level::Warn => MessageType::Warning,
            Level::Info => MessageType::Normal,
            Level::Debug | Level::Trace => MessageType::Debug,
        };

        Message {
            module: record
                .module_path()
                .and_then(|path| path.split("::").last())
                .unwrap_or("unknown")
                .to_string(),
            msg_type,
            string: record.args().to_string(),
            time: Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        }
    }

    /// Serializes the message with its length (including the length itself) in front.
    fn pack(&self) -> Option<Vec<u8>> {
        let serialized = bincode::serialize::<Message>(self).ok()?;

        let mut bytes = Vec::from(u32::to_le_bytes(serialized.len() as u32 + 4));
        bytes.extend(&serialized);

        Some(bytes)
    }

    fn write_to(&self, out: &mut impl Write) -> std::io::Result<()> {
        let level_name = match self.msg_type {
            MessageType::Normal => "info",
            MessageType::Error => "error",
            MessageType::Warning => "warning",
            MessageType::Debug => "debug",
        };

        //      [date time] [module] [level] Text
        writeln!(
            out,
            "[{}] [{}] [{}] {}",
            self.time, self.module, level_name, self.string
        )
    }
}

static MSG_SENDER: OnceCell<Mutex<Sender<Message>>> = OnceCell::new();

struct Logger;

static LOGGER: Logger = Logger;

impl log::Log for Logger {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if let Some(sender) = MSG_SENDER.get() {
            // Nothing sensible to do if the writer thread has gone.
            let _ = sender.lock().send(Message::from_record(record));
        }
    }

    fn flush(&self) {}
}

/// The message a panic was raised with.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "no message".to_string())
}

fn panic_hook(info: &PanicHookInfo) {
    let message = panic_message(info.payload());

    let location = info
        .location()
        .map(|location| location.to_string())
        .unwrap_or_else(|| "unknown location".to_string());

    // Panics in diversions are caught and recovered from, so this only records what happened.
    log::error!(
        "Panic at {location}: {message}\n{:?}",
        backtrace::Backtrace::new()
    );
}

/// Level used unless the `debug` feature is enabled.
const LEVEL: LevelFilter = if cfg!(feature = "debug") {
    LevelFilter::Trace
} else {
    LevelFilter::Info
};

/// Starts logging to the places `options` asks for. Only the first call has any effect.
pub fn init(options: &Options, directory: &Path) {
    if log::set_logger(&LOGGER).is_err() {
        return;
    }

    log::set_max_level(LEVEL);
    std::panic::set_hook(Box::new(panic_hook));

    let (sender, receiver) = mpsc::channel::<Message>();

    if MSG_SENDER.set(Mutex::new(sender)).is_err() {
        return;
    }

    let mut file = options.log_file.as_ref().and_then(|path| {
        let path = Options::resolve(directory, path);

        match File::create(&path) {
            Ok(file) => Some(file),
            Err(err) => {
                eprintln!("Unable to create log file '{}': {err}", path.display());
                None
            }
        }
    });

    // Only send packets in debug builds.
    let socket = options
        .log_address
        .clone()
        .filter(|_| cfg!(feature = "debug"))
        .and_then(|address| {
            net::UdpSocket::bind("0.0.0.0:0")
                .ok()
                .map(|socket| (socket, address))
        });

    // Writing happens on a background thread so that server code never waits on the disk.
    std::thread::spawn(move || {
        for message in receiver {
            if let Some(file) = file.as_mut() {
                let _ = message.write_to(file);
            }

            if let (Some((socket, address)), Some(bytes)) = (&socket, message.pack()) {
                let _ = socket.send_to(&bytes, address.as_str());
            }
        }
    });
}
