// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory host tree behind a `MockProvider`
//!
//! Tests keep a [`MockHost`] clone to change the host out-of-band (delete a
//! file behind the cache's back, flip permission bits) and to count how many
//! host handles were opened and closed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::error::{FsError, FsResult};
use crate::provider::MockProvider;
use crate::types::{DirListing, HostHandle, Timespec};

pub const DIR_MODE: u32 = libc::S_IFDIR as u32 | 0o755;
pub const FILE_MODE: u32 = libc::S_IFREG as u32 | 0o644;

#[derive(Debug)]
struct Entry {
    mode: u32,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct HostState {
    entries: BTreeMap<String, Entry>,
    next_handle: u64,
    open: HashMap<u64, String>,
    closed: Vec<HostHandle>,
}

impl HostState {
    fn issue(&mut self, path: &str) -> HostHandle {
        self.next_handle += 1;
        self.open.insert(self.next_handle, path.to_string());
        HostHandle(self.next_handle)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = format!("{path}/");
        self.entries
            .keys()
            .filter_map(|p| p.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MockHost {
    state: Arc<Mutex<HostState>>,
}

impl MockHost {
    pub fn new() -> Self {
        let host = Self::default();
        host.add_dir("");
        host
    }

    fn with<R>(&self, f: impl FnOnce(&mut HostState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn add_dir(&self, path: &str) {
        self.with(|s| {
            s.entries.insert(
                path.to_string(),
                Entry {
                    mode: DIR_MODE,
                    data: Vec::new(),
                },
            )
        });
    }

    pub fn add_file(&self, path: &str, contents: &[u8]) {
        self.with(|s| {
            s.entries.insert(
                path.to_string(),
                Entry {
                    mode: FILE_MODE,
                    data: contents.to_vec(),
                },
            )
        });
    }

    /// Delete a path (and anything below it) without telling the cache.
    pub fn remove_out_of_band(&self, path: &str) {
        let prefix = format!("{path}/");
        self.with(|s| s.entries.retain(|p, _| p != path && !p.starts_with(&prefix)));
    }

    pub fn set_mode(&self, path: &str, mode: u32) {
        self.with(|s| {
            if let Some(entry) = s.entries.get_mut(path) {
                entry.mode = mode;
            }
        });
    }

    pub fn exists(&self, path: &str) -> bool {
        self.with(|s| s.entries.contains_key(path))
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.with(|s| s.entries.get(path).map(|e| e.data.clone()))
    }

    pub fn open_handles(&self) -> usize {
        self.with(|s| s.open.len())
    }

    pub fn closed_handles(&self) -> usize {
        self.with(|s| s.closed.len())
    }

    fn timestamp(&self, sec: i64) -> impl FnMut(&str) -> FsResult<Timespec> + Send + 'static {
        let host = self.clone();
        move |path| {
            if host.exists(path) {
                Ok(Timespec::new(sec, 0))
            } else {
                Err(FsError::NotFound)
            }
        }
    }

    /// A `MockProvider` whose every method is answered from this host.
    pub fn provider(&self) -> MockProvider {
        let mut provider = MockProvider::new();

        let host = self.clone();
        provider.expect_open().returning(move |path| {
            host.with(|s| {
                if s.entries.contains_key(path) {
                    Ok(s.issue(path))
                } else {
                    Err(FsError::NotFound)
                }
            })
        });

        let host = self.clone();
        provider.expect_create().returning(move |path| {
            host.with(|s| {
                if s.entries.contains_key(path) {
                    return Err(FsError::AlreadyExists);
                }
                s.entries.insert(
                    path.to_string(),
                    Entry {
                        mode: FILE_MODE,
                        data: Vec::new(),
                    },
                );
                Ok(s.issue(path))
            })
        });

        let host = self.clone();
        provider.expect_mkdir().returning(move |path| {
            host.with(|s| {
                if s.entries.contains_key(path) {
                    return Err(FsError::AlreadyExists);
                }
                s.entries.insert(
                    path.to_string(),
                    Entry {
                        mode: DIR_MODE,
                        data: Vec::new(),
                    },
                );
                Ok(s.issue(path))
            })
        });

        let host = self.clone();
        provider.expect_remove().returning(move |path| {
            host.with(|s| s.entries.remove(path).map(|_| ()).ok_or(FsError::NotFound))
        });

        let host = self.clone();
        provider.expect_rmdir().returning(move |path| {
            host.with(|s| {
                if !s.entries.contains_key(path) {
                    return Err(FsError::NotFound);
                }
                if !s.children(path).is_empty() {
                    return Err(FsError::Busy);
                }
                s.entries.remove(path);
                Ok(())
            })
        });

        let host = self.clone();
        provider.expect_rename().returning(move |from, to, _is_dir| {
            host.with(|s| {
                if !s.entries.contains_key(from) {
                    return Err(FsError::NotFound);
                }
                let from_prefix = format!("{from}/");
                let moved: Vec<String> = s
                    .entries
                    .keys()
                    .filter(|p| p.as_str() == from || p.starts_with(&from_prefix))
                    .cloned()
                    .collect();
                let to_prefix = format!("{to}/");
                s.entries.retain(|p, _| p != to && !p.starts_with(&to_prefix));
                for old in moved {
                    if let Some(entry) = s.entries.remove(&old) {
                        let new = format!("{to}{}", &old[from.len()..]);
                        s.entries.insert(new, entry);
                    }
                }
                Ok(())
            })
        });

        let host = self.clone();
        provider.expect_get_mode().returning(move |path| {
            host.with(|s| s.entries.get(path).map(|e| e.mode).ok_or(FsError::NotFound))
        });

        let host = self.clone();
        provider.expect_get_size().returning(move |path| {
            host.with(|s| {
                s.entries
                    .get(path)
                    .map(|e| e.data.len() as u64)
                    .ok_or(FsError::NotFound)
            })
        });

        provider.expect_get_atime().returning(self.timestamp(1_700_000_000));
        provider.expect_get_mtime().returning(self.timestamp(1_700_000_100));
        provider.expect_get_ctime().returning(self.timestamp(1_700_000_200));

        let host = self.clone();
        provider.expect_read().returning(move |handle, offset, buf| {
            host.with(|s| {
                let path = s.open.get(&handle.0).cloned().ok_or(FsError::InvalidArgument)?;
                let entry = s.entries.get(&path).ok_or(FsError::NotFound)?;
                let start = (offset as usize).min(entry.data.len());
                let n = buf.len().min(entry.data.len() - start);
                buf[..n].copy_from_slice(&entry.data[start..start + n]);
                Ok(n)
            })
        });

        let host = self.clone();
        provider.expect_write().returning(move |handle, offset, data| {
            host.with(|s| {
                let path = s.open.get(&handle.0).cloned().ok_or(FsError::InvalidArgument)?;
                let entry = s.entries.get_mut(&path).ok_or(FsError::NotFound)?;
                let end = offset as usize + data.len();
                if entry.data.len() < end {
                    entry.data.resize(end, 0);
                }
                entry.data[offset as usize..end].copy_from_slice(data);
                Ok(data.len())
            })
        });

        let host = self.clone();
        provider.expect_close().returning(move |handle| {
            host.with(|s| {
                s.open.remove(&handle.0);
                s.closed.push(handle);
            })
        });

        let host = self.clone();
        provider.expect_truncate().returning(move |path| {
            host.with(|s| {
                let entry = s.entries.get_mut(path).ok_or(FsError::NotFound)?;
                entry.data.clear();
                Ok(())
            })
        });

        let host = self.clone();
        provider.expect_readdir().returning(move |path, start, max| {
            host.with(|s| {
                if !s.entries.contains_key(path) {
                    return Err(FsError::NotFound);
                }
                let mut names = vec![".".to_string(), "..".to_string()];
                names.extend(s.children(path));
                let end = start.saturating_add(max).min(names.len());
                let page = names.get(start..end).map(<[String]>::to_vec).unwrap_or_default();
                Ok(DirListing {
                    names: page,
                    eof: end >= names.len(),
                })
            })
        });

        provider
    }
}
