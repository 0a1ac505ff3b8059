// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Writing Chrome trace event data.
//!
//! See the official specification of the Chrome trace event format:
//! https://docs.google.com/document/d/1CvAClvFfyA5R-PhYUmn5OOQtYMH4h6I0nSsKchNAySU/preview

use std::io::{BufWriter, Error, ErrorKind, Read, Result, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Represents the type of a trace event, aka phase.
#[non_exhaustive]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Phase {
    #[serde(rename = "B")]
    Begin,
    #[serde(rename = "E")]
    End,
    #[serde(rename = "X")]
    Complete,
    #[serde(rename = "i", alias = "I")]
    Instant,
    #[serde(rename = "M")]
    Metadata,
}

/// Represents a trace event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "cat")]
    pub category: String,
    #[serde(rename = "ph")]
    pub phase: Phase,
    /// Microseconds since the trace epoch.
    #[serde(rename = "ts")]
    pub timestamp: f64,
    /// Duration in microseconds; only meaningful for [`Phase::Complete`].
    #[serde(rename = "dur", skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(rename = "pid")]
    pub process_id: i64,
    #[serde(rename = "tid")]
    pub thread_id: i64,
    #[serde(rename = "args", skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

impl Event {
    /// A complete ("X") event spanning `[timestamp, timestamp + duration]`.
    pub fn complete(name: &str, timestamp: f64, duration: f64, thread_id: i64) -> Self {
        Self {
            name: name.to_owned(),
            category: "command".to_owned(),
            phase: Phase::Complete,
            timestamp,
            duration: Some(duration),
            process_id: std::process::id() as i64,
            thread_id,
            args: None,
        }
    }
}

/// Holds a series of trace events in the JSON array format.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub events: Vec<Event>,
}

impl Trace {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn load(r: impl Read) -> Result<Self> {
        let events: Vec<Event> = serde_json::from_reader(r)?;
        Ok(Trace { events })
    }

    /// Saves trace events to [`Write`].
    ///
    /// If you want to write trace events in a streamed way, use
    /// [`StreamWriter`] instead.
    pub fn save(&self, w: impl Write) -> Result<()> {
        let mut w = BufWriter::new(w);
        serde_json::to_writer(&mut w, &self.events)?;
        w.flush()
    }
}

/// Streaming writer of trace events.
pub struct StreamWriter<W>
where
    W: Write,
{
    writer: BufWriter<W>,
    first_event_was_written: bool,
    finished: bool,
}

impl<W> StreamWriter<W>
where
    W: Write,
{
    /// Creates a new [`StreamWriter`]. It returns an error if it fails to
    /// write the header part of a trace file.
    ///
    /// Remember to call [`StreamWriter::finish`] on finishing to write
    /// events; a trace cut short by a crash stays loadable by Chrome but is
    /// not valid JSON.
    pub fn new(writer: W) -> Result<Self> {
        let mut writer = BufWriter::new(writer);
        writer.write_all("[\n".as_bytes())?;
        Ok(Self {
            writer,
            first_event_was_written: false,
            finished: false,
        })
    }

    pub fn write_event(&mut self, event: &Event) -> Result<()> {
        if self.finished {
            return Err(Error::new(ErrorKind::Other, "Stream already finished"));
        }
        if self.first_event_was_written {
            self.writer.write_all(",\n".as_bytes())?;
        } else {
            self.first_event_was_written = true;
        }
        serde_json::to_writer(&mut self.writer, event)?;
        Ok(())
    }

    /// Finishes writing events by writing a footer and flushing the buffer.
    /// It is safe to call this method multiple times.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.writer.write_all("\n]\n".as_bytes())?;
        self.writer.flush()?;
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_events() -> Vec<Event> {
        vec![
            Event {
                name: "compile a.o".to_owned(),
                category: "command".to_owned(),
                phase: Phase::Begin,
                timestamp: 829.0,
                duration: None,
                process_id: 22630,
                thread_id: 1,
                args: None,
            },
            Event {
                name: "compile a.o".to_owned(),
                category: "command".to_owned(),
                phase: Phase::End,
                timestamp: 833.0,
                duration: None,
                process_id: 22630,
                thread_id: 1,
                args: None,
            },
        ]
    }

    #[test]
    fn test_trace_save_load() -> Result<()> {
        let original_trace = Trace {
            events: sample_events(),
        };

        let loaded_trace = {
            let mut buf: Vec<u8> = Vec::new();
            original_trace.save(&mut buf)?;
            Trace::load(buf.as_slice())?
        };

        assert_eq!(original_trace, loaded_trace);
        Ok(())
    }

    #[test]
    fn test_stream_writer() -> Result<()> {
        let mut buf: Vec<u8> = Vec::new();

        let mut stream = StreamWriter::new(&mut buf)?;
        for event in sample_events().iter() {
            stream.write_event(event)?;
        }
        stream.finish()?;

        // Subsequent write_event() calls should fail, second finish is fine.
        assert!(stream.write_event(&sample_events()[0]).is_err());
        stream.finish()?;
        drop(stream);

        let trace = Trace::load(buf.as_slice())?;
        assert_eq!(trace.events, sample_events());
        Ok(())
    }

    #[test]
    fn test_stream_writer_empty() -> Result<()> {
        let mut buf: Vec<u8> = Vec::new();
        StreamWriter::new(&mut buf)?.finish()?;
        assert_eq!(buf.as_slice(), "[\n\n]\n".as_bytes());
        Ok(())
    }

    #[test]
    fn test_complete_event_serializes_duration() -> Result<()> {
        let e = Event::complete("link", 10.0, 5.0, 3);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["ph"], "X");
        assert_eq!(json["dur"], 5.0);
        Ok(())
    }
}
