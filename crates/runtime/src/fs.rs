//! Non-blocking file operations.
//!
//! The blocking work runs on the executor's blocking pool; the promise
//! settles back on the loop. Every operation is cancellable: cancellation
//! rejects the promise immediately and the in-flight operation aborts at
//! its next chunk boundary. The loop work unit is released exactly once
//! either way.

use std::{
    fs::{
        File,
        OpenOptions,
    },
    io::{
        Read,
        Seek,
        SeekFrom,
        Write,
    },
    path::{
        Path,
        PathBuf,
    },
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::SystemTime,
};

use bytes::Bytes;
use common::{
    knobs,
    Error,
    Result,
};

use crate::{
    event_loop::{
        LoopHandle,
        WorkKind,
    },
    promise::Promise,
    timer::TimerId,
};

#[derive(Clone, Debug, Default)]
pub struct FileReadOptions {
    pub offset: Option<u64>,
    pub length: Option<u64>,
    pub buffer_size: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct FileWriteOptions {
    pub create_parents: bool,
    pub buffer_size: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub len: u64,
    pub is_file: bool,
    pub is_dir: bool,
    pub modified: Option<SystemTime>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileEvent {
    Created,
    Modified,
    Removed,
}

fn run_file_op<T, F>(handle: &LoopHandle, name: &'static str, op: F) -> Promise<T>
where
    T: Send + Clone + 'static,
    F: FnOnce(&AtomicBool) -> Result<T> + Send + 'static,
{
    let (promise, resolver) = Promise::pending();
    let cancelled = Arc::new(AtomicBool::new(false));
    {
        let cancelled = cancelled.clone();
        promise.on_cancel(move || cancelled.store(true, Ordering::SeqCst));
    }
    let guard = handle.register_work(WorkKind::FileOp);
    handle.spawn_detached(name, async move {
        let _guard = guard;
        match tokio::task::spawn_blocking(move || op(&cancelled)).await {
            // A post-cancellation result is dropped by settle-once.
            Ok(result) => resolver.settle(result),
            Err(e) => resolver.reject(Error::file_io(format!("{name} worker failed: {e}"))),
        }
    });
    promise
}

fn bail_if_cancelled(cancelled: &AtomicBool) -> Result<()> {
    if cancelled.load(Ordering::SeqCst) {
        return Err(Error::cancelled("file operation cancelled"));
    }
    Ok(())
}

pub fn read(handle: &LoopHandle, path: impl Into<PathBuf>, options: FileReadOptions) -> Promise<Bytes> {
    let path = path.into();
    run_file_op(handle, "fs_read", move |cancelled| {
        let buffer_size = options.buffer_size.unwrap_or(*knobs::FILE_STREAM_BUFFER_SIZE);
        let mut file = File::open(&path)?;
        if let Some(offset) = options.offset {
            file.seek(SeekFrom::Start(offset))?;
        }
        let mut remaining = options.length;
        let mut out = Vec::new();
        let mut buf = vec![0u8; buffer_size];
        loop {
            bail_if_cancelled(cancelled)?;
            let want = match remaining {
                Some(0) => break,
                Some(n) => buf.len().min(n as usize),
                None => buf.len(),
            };
            let n = file.read(&mut buf[..want])?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
            if let Some(r) = remaining.as_mut() {
                *r -= n as u64;
            }
        }
        Ok(Bytes::from(out))
    })
}

pub fn write(
    handle: &LoopHandle,
    path: impl Into<PathBuf>,
    contents: Bytes,
    options: FileWriteOptions,
) -> Promise<u64> {
    let path = path.into();
    run_file_op(handle, "fs_write", move |cancelled| {
        write_blocking(&path, &contents, &options, false, cancelled)
    })
}

pub fn append(
    handle: &LoopHandle,
    path: impl Into<PathBuf>,
    contents: Bytes,
    options: FileWriteOptions,
) -> Promise<u64> {
    let path = path.into();
    run_file_op(handle, "fs_append", move |cancelled| {
        write_blocking(&path, &contents, &options, true, cancelled)
    })
}

fn write_blocking(
    path: &Path,
    contents: &[u8],
    options: &FileWriteOptions,
    append: bool,
    cancelled: &AtomicBool,
) -> Result<u64> {
    if options.create_parents {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = if append {
        OpenOptions::new().create(true).append(true).open(path)?
    } else {
        File::create(path)?
    };
    let buffer_size = options.buffer_size.unwrap_or(*knobs::FILE_STREAM_BUFFER_SIZE);
    let mut written = 0u64;
    for chunk in contents.chunks(buffer_size) {
        bail_if_cancelled(cancelled)?;
        file.write_all(chunk)?;
        written += chunk.len() as u64;
    }
    file.flush()?;
    Ok(written)
}

pub fn exists(handle: &LoopHandle, path: impl Into<PathBuf>) -> Promise<bool> {
    let path = path.into();
    run_file_op(handle, "fs_exists", move |_| Ok(path.exists()))
}

pub fn stat(handle: &LoopHandle, path: impl Into<PathBuf>) -> Promise<FileStat> {
    let path = path.into();
    run_file_op(handle, "fs_stat", move |_| {
        let meta = std::fs::metadata(&path)?;
        Ok(FileStat {
            len: meta.len(),
            is_file: meta.is_file(),
            is_dir: meta.is_dir(),
            modified: meta.modified().ok(),
        })
    })
}

pub fn remove_file(handle: &LoopHandle, path: impl Into<PathBuf>) -> Promise<()> {
    let path = path.into();
    run_file_op(handle, "fs_remove_file", move |_| {
        std::fs::remove_file(&path)?;
        Ok(())
    })
}

pub fn mkdir(handle: &LoopHandle, path: impl Into<PathBuf>, recursive: bool) -> Promise<()> {
    let path = path.into();
    run_file_op(handle, "fs_mkdir", move |_| {
        if recursive {
            std::fs::create_dir_all(&path)?;
        } else {
            std::fs::create_dir(&path)?;
        }
        Ok(())
    })
}

pub fn rmdir(handle: &LoopHandle, path: impl Into<PathBuf>) -> Promise<()> {
    let path = path.into();
    run_file_op(handle, "fs_rmdir", move |_| {
        std::fs::remove_dir(&path)?;
        Ok(())
    })
}

pub fn copy(handle: &LoopHandle, from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Promise<u64> {
    let from = from.into();
    let to = to.into();
    run_file_op(handle, "fs_copy", move |cancelled| {
        let mut src = File::open(&from)?;
        let mut dst = File::create(&to)?;
        let mut buf = vec![0u8; *knobs::FILE_STREAM_BUFFER_SIZE];
        let mut copied = 0u64;
        loop {
            bail_if_cancelled(cancelled)?;
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n])?;
            copied += n as u64;
        }
        dst.flush()?;
        Ok(copied)
    })
}

pub fn rename(handle: &LoopHandle, from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Promise<()> {
    let from = from.into();
    let to = to.into();
    run_file_op(handle, "fs_rename", move |_| {
        std::fs::rename(&from, &to)?;
        Ok(())
    })
}

pub struct FileWatch {
    handle: LoopHandle,
    timer: TimerId,
}

impl FileWatch {
    pub fn unwatch(self) {
        self.handle.cancel_timer(self.timer);
    }
}

/// Watch a path by polling its metadata on a repeating loop timer.
pub fn watch(
    handle: &LoopHandle,
    path: impl Into<PathBuf>,
    mut callback: impl FnMut(FileEvent) + Send + 'static,
) -> FileWatch {
    let path = path.into();
    let mut last = snapshot(&path);
    let timer = handle.schedule_repeating(
        std::time::Duration::from_millis(*knobs::FILE_WATCH_POLL_MS),
        move || {
            let current = snapshot(&path);
            match (&last, &current) {
                (None, Some(_)) => callback(FileEvent::Created),
                (Some(_), None) => callback(FileEvent::Removed),
                (Some(prev), Some(next)) if prev != next => callback(FileEvent::Modified),
                _ => (),
            }
            last = current;
        },
    );
    FileWatch {
        handle: handle.clone(),
        timer,
    }
}

fn snapshot(path: &Path) -> Option<(u64, Option<SystemTime>)> {
    std::fs::metadata(path)
        .ok()
        .map(|meta| (meta.len(), meta.modified().ok()))
}
