// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/spinwatch

//! Serial line adapter
//!
//! The firmware speaks a line protocol:
//!
//! - `<id>,<ax>,<ay>,<az>` raw accelerometer reading
//! - `MACHINE:<id>:<IN_USE|FREE>` pre-classified status, ids counted from 0
//! - `READY` / `PONG` handshake noise

use chrono::{DateTime, Utc};
use tracing::debug;

use super::SensorSample;
use crate::core::{IngestError, MachineId};

/// Turns serial lines into samples
#[derive(Debug, Clone)]
pub struct LineParser {
    threshold: f64,
    status_id_offset: u32,
}

impl LineParser {
    pub fn new(threshold: f64, status_id_offset: u32) -> Self {
        Self { threshold, status_id_offset }
    }

    /// `Ok(None)` for lines that carry no reading
    pub fn parse(&self, line: &str, received_at: DateTime<Utc>) -> Result<Option<SensorSample>, IngestError> {
        let line = line.trim();
        match line {
            "" => return Ok(None),
            "READY" | "PONG" => {
                debug!("Serial handshake: {}", line);
                return Ok(None);
            }
            _ => {}
        }

        if let Some(rest) = line.strip_prefix("MACHINE:") {
            return self.parse_status(line, rest, received_at).map(Some);
        }

        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        let &[id, ax, ay, az] = parts.as_slice() else {
            return Err(malformed(line, "expected id,ax,ay,az"));
        };

        let machine_id: MachineId = id.parse().map_err(|_| malformed(line, "bad machine id"))?;
        let axis = |v: &str| v.parse::<f64>().map_err(|_| malformed(line, "bad axis value"));

        Ok(Some(SensorSample::new(machine_id, axis(ax)?, axis(ay)?, axis(az)?, received_at)))
    }

    fn parse_status(&self, line: &str, rest: &str, received_at: DateTime<Utc>) -> Result<SensorSample, IngestError> {
        let (id, status) = rest.split_once(':').ok_or_else(|| malformed(line, "expected MACHINE:<id>:<status>"))?;

        let raw_id: u32 = id.trim().parse().map_err(|_| malformed(line, "bad machine id"))?;
        let machine_id = raw_id
            .checked_add(self.status_id_offset)
            .ok_or_else(|| malformed(line, "machine id out of range"))?;

        let in_use = match status.trim() {
            "IN_USE" => true,
            "FREE" => false,
            _ => return Err(malformed(line, "status must be IN_USE or FREE")),
        };

        Ok(SensorSample::from_status(machine_id, in_use, self.threshold, received_at))
    }
}

fn malformed(line: &str, reason: &str) -> IngestError {
    IngestError::MalformedSample(format!("{}: {:?}", reason, line))
}

#[cfg(feature = "serial")]
pub use port::SerialSource;

#[cfg(feature = "serial")]
mod port {
    use std::io::{BufRead, BufReader, ErrorKind, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::JoinHandle;
    use std::time::Duration;

    use anyhow::{anyhow, Context, Result};
    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::mpsc;
    use tracing::{info, warn};

    use super::LineParser;
    use crate::config::SerialConfig;
    use crate::sensors::{SampleSource, SensorSample, SourceStatus};

    /// Line-oriented serial port source. A blocking reader thread owns the
    /// port and hands complete lines to the async side.
    pub struct SerialSource {
        id: String,
        config: SerialConfig,
        parser: LineParser,
        status: SourceStatus,
        lines: Option<mpsc::Receiver<std::io::Result<String>>>,
        stop: Arc<AtomicBool>,
        reader: Option<JoinHandle<()>>,
    }

    impl SerialSource {
        pub fn new(config: SerialConfig, threshold: f64) -> Self {
            Self {
                id: format!("serial://{}", config.port),
                parser: LineParser::new(threshold, config.status_id_offset),
                config,
                status: SourceStatus::Disconnected,
                lines: None,
                stop: Arc::new(AtomicBool::new(false)),
                reader: None,
            }
        }
    }

    fn read_lines(
        port: Box<dyn serialport::SerialPort>,
        tx: mpsc::Sender<std::io::Result<String>>,
        stop: Arc<AtomicBool>,
    ) {
        let mut reader = BufReader::new(port);
        let mut line = String::new();

        while !stop.load(Ordering::Relaxed) {
            match reader.read_line(&mut line) {
                Ok(0) => {
                    let _ = tx.blocking_send(Err(ErrorKind::UnexpectedEof.into()));
                    break;
                }
                Ok(_) => {
                    if tx.blocking_send(Ok(std::mem::take(&mut line))).is_err() {
                        break;
                    }
                }
                // Partial data stays in `line` until the newline arrives
                Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    }

    #[async_trait]
    impl SampleSource for SerialSource {
        fn id(&self) -> &str {
            &self.id
        }

        fn status(&self) -> SourceStatus {
            self.status
        }

        async fn connect(&mut self) -> Result<()> {
            self.status = SourceStatus::Connecting;
            info!("Connecting to {} at {} baud", self.config.port, self.config.baud_rate);

            let mut port = serialport::new(&self.config.port, self.config.baud_rate)
                .timeout(Duration::from_millis(self.config.read_timeout_ms))
                .open()
                .with_context(|| format!("opening serial port {}", self.config.port))?;

            if self.config.request_status_on_connect {
                port.write_all(b"STATUS\n").context("requesting machine status")?;
            }

            let (tx, rx) = mpsc::channel(256);
            let stop = Arc::new(AtomicBool::new(false));
            let thread_stop = stop.clone();
            let reader = std::thread::Builder::new()
                .name("serial-reader".to_string())
                .spawn(move || read_lines(port, tx, thread_stop))
                .context("spawning serial reader")?;

            self.lines = Some(rx);
            self.stop = stop;
            self.reader = Some(reader);
            self.status = SourceStatus::Active;
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.stop.store(true, Ordering::Relaxed);
            self.lines = None;
            if let Some(reader) = self.reader.take() {
                // The reader notices the flag within one read timeout
                tokio::task::spawn_blocking(move || reader.join())
                    .await?
                    .map_err(|_| anyhow!("serial reader panicked"))?;
            }
            self.status = SourceStatus::Disconnected;
            Ok(())
        }

        async fn next_samples(&mut self) -> Result<Vec<SensorSample>> {
            let lines = self.lines.as_mut().ok_or_else(|| anyhow!("serial source not connected"))?;

            loop {
                let line = match lines.recv().await {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        self.status = SourceStatus::Error;
                        return Err(anyhow!("serial read failed: {}", e));
                    }
                    None => {
                        self.status = SourceStatus::Error;
                        return Err(anyhow!("serial reader stopped"));
                    }
                };

                match self.parser.parse(&line, Utc::now()) {
                    Ok(Some(sample)) => return Ok(vec![sample]),
                    Ok(None) => {}
                    Err(e) => warn!("Dropping serial line: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> LineParser {
        LineParser::new(1000.0, 1)
    }

    #[test]
    fn test_raw_reading() {
        let now = Utc::now();
        let sample = parser().parse("2,1200.5,-300,45.25\r\n", now).unwrap().unwrap();

        assert_eq!(sample.machine_id, 2);
        assert_eq!((sample.ax, sample.ay, sample.az), (1200.5, -300.0, 45.25));
        assert_eq!(sample.observed_at, now);
    }

    #[test]
    fn test_status_line_offsets_id() {
        let now = Utc::now();
        let busy = parser().parse("MACHINE:0:IN_USE", now).unwrap().unwrap();
        assert_eq!(busy.machine_id, 1);
        assert!(busy.ax > 1000.0);

        let free = parser().parse("MACHINE:3:FREE", now).unwrap().unwrap();
        assert_eq!(free.machine_id, 4);
        assert_eq!(free.ax, 0.0);

        let unshifted = LineParser::new(1000.0, 0).parse("MACHINE:3:FREE", now).unwrap().unwrap();
        assert_eq!(unshifted.machine_id, 3);
    }

    #[test]
    fn test_handshake_lines_ignored() {
        let now = Utc::now();
        assert!(parser().parse("READY", now).unwrap().is_none());
        assert!(parser().parse("PONG\n", now).unwrap().is_none());
        assert!(parser().parse("   ", now).unwrap().is_none());
    }

    #[test]
    fn test_malformed_lines() {
        let now = Utc::now();
        for line in ["1,2,3", "a,1,2,3", "1,x,2,3", "MACHINE:1", "MACHINE:x:FREE", "MACHINE:1:BUSY", "hello"] {
            let err = parser().parse(line, now).unwrap_err();
            assert!(matches!(err, IngestError::MalformedSample(_)), "{}", line);
        }
    }
}
