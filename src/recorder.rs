// ===============================
// src/recorder.rs
// ===============================
//
// JSONL journal of pub/sub notifications:
// - one line per envelope, tagged with its channel
// - BufWriter, flushed every second and every FLUSH_EVERY lines
// - parent directory created on demand
// - on a write error the file is reopened; while it cannot be opened,
//   lines are dropped (counted in the log) instead of stopping the task
//
// ENV: `RECORD_FILE=/path/to/notifications.jsonl` enables it (see main.rs).
//
use std::path::Path;

use serde_json::{json, Value};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::{broadcast, mpsc},
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

const FLUSH_EVERY: u32 = 1000;

/// A notification as it went over the bus.
#[derive(Debug, Clone)]
pub struct Record {
    pub channel: String,
    pub payload: String,
}

async fn open_writer(path: &str) -> Option<BufWriter<File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(?e, %path, "recorder: create_dir_all failed");
            }
        }
    }
    match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(f) => Some(BufWriter::new(f)),
        Err(e) => {
            error!(?e, %path, "recorder: open failed");
            None
        }
    }
}

fn to_line(rec: &Record) -> String {
    // keep the envelope as JSON when it parses, raw text otherwise
    let payload = serde_json::from_str::<Value>(&rec.payload).unwrap_or_else(|_| Value::String(rec.payload.clone()));
    let mut line = json!({ "channel": rec.channel, "envelope": payload }).to_string();
    line.push('\n');
    line
}

async fn write_line(writer: &mut Option<BufWriter<File>>, path: &str, line: &str) -> bool {
    if writer.is_none() {
        *writer = open_writer(path).await;
    }
    let Some(w) = writer.as_mut() else { return false };
    if let Err(e) = w.write_all(line.as_bytes()).await {
        error!(?e, "recorder: write failed, reopening");
        *writer = open_writer(path).await;
        let Some(w) = writer.as_mut() else { return false };
        if let Err(e2) = w.write_all(line.as_bytes()).await {
            error!(?e2, "recorder: write failed again after reopen");
            return false;
        }
    }
    true
}

pub async fn run(mut rx: mpsc::Receiver<Record>, path: String) {
    info!(%path, "recorder: started");
    let mut writer = open_writer(&path).await;

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_flush: u32 = 0;
    let mut dropped: u64 = 0;

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(rec) = maybe else {
                    if let Some(w) = writer.as_mut() {
                        let _ = w.flush().await;
                    }
                    info!(dropped, "recorder: channel closed, stopped");
                    break;
                };
                if !write_line(&mut writer, &path, &to_line(&rec)).await {
                    dropped += 1;
                    continue;
                }
                since_flush += 1;
                if since_flush >= FLUSH_EVERY {
                    if let Some(w) = writer.as_mut() {
                        let _ = w.flush().await;
                    }
                    since_flush = 0;
                }
            }
            _ = tick.tick() => {
                if let Some(w) = writer.as_mut() {
                    let _ = w.flush().await;
                }
                since_flush = 0;
            }
        }
    }
}

/// Forward one broadcast channel into the recorder until either side closes.
pub async fn forward(channel: &'static str, mut sub: broadcast::Receiver<String>, tx: mpsc::Sender<Record>) {
    loop {
        match sub.recv().await {
            Ok(payload) => {
                if tx.send(Record { channel: channel.to_string(), payload }).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(%channel, skipped = n, "recorder: subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheBus, MemoryCache};
    use crate::domain::{Envelope, CH_TRADES};
    use std::sync::Arc;

    #[tokio::test]
    async fn journals_envelopes_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.jsonl").to_string_lossy().to_string();

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(run(rx, path.clone()));

        let cache = Arc::new(MemoryCache::default());
        let fwd = tokio::spawn(forward(CH_TRADES, cache.subscribe(CH_TRADES), tx.clone()));
        cache.publish(CH_TRADES, &Envelope::new("trade_submitted", json!({"amount": 3}))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(Record { channel: "raw".into(), payload: "not json".into() }).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        fwd.abort();
        drop(tx);
        let _ = fwd.await;
        task.await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["channel"], "trades");
        assert_eq!(lines[0]["envelope"]["type"], "trade_submitted");
        assert_eq!(lines[0]["envelope"]["data"]["amount"], 3);
        assert_eq!(lines[1]["envelope"], "not json");
    }

    #[tokio::test]
    async fn unopenable_path_drops_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        // a directory cannot be opened for appending
        let path = dir.path().to_string_lossy().to_string();
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(run(rx, path));
        tx.send(Record { channel: "trades".into(), payload: "{}".into() }).await.unwrap();
        drop(tx);
        task.await.unwrap();
    }
}
