// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Artifact store seam: a content-addressed blob bag with opaque string keys.
//!
//! The worker only needs get/put/exists/presign. The production deployment
//! fronts an object store; [`LocalStore`] is the filesystem-backed reference
//! implementation used for single-host installs and tests.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base::{bail, err, Error, ErrorKind, ResultExt as _};

pub trait ArtifactStore: Send + Sync {
    /// Opens the blob for reading. Fails with `NotFound` if absent.
    fn open(&self, key: &str) -> Result<Box<dyn Read + Send>, Error>;

    /// Stores a local file under `key`, replacing any previous blob.
    fn save_file(&self, src: &Path, key: &str) -> Result<(), Error>;

    fn exists(&self, key: &str) -> Result<bool, Error>;

    /// Returns a URL a client can fetch the blob from for the next `ttl`.
    fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, Error>;
}

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            err!(
                StorageUnavailable,
                msg("unable to create storage root {}", root.display()),
                source(e)
            )
        })?;
        Ok(LocalStore { root })
    }

    fn full_path(&self, key: &str) -> Result<PathBuf, Error> {
        // Keys are opaque to callers but must stay inside the root.
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        {
            bail!(StorageUnavailable, msg("malformed storage key {key:?}"));
        }
        Ok(self.root.join(key))
    }
}

impl ArtifactStore for LocalStore {
    fn open(&self, key: &str) -> Result<Box<dyn Read + Send>, Error> {
        let path = self.full_path(key)?;
        match File::open(&path) {
            Ok(f) => Ok(Box::new(f)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(err!(NotFound, msg("no blob at {key}")))
            }
            Err(e) => Err(err!(StorageUnavailable, msg("unable to open {key}"), source(e))),
        }
    }

    fn save_file(&self, src: &Path, key: &str) -> Result<(), Error> {
        let path = self.full_path(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .err_kind(ErrorKind::StorageUnavailable)?;
        }
        // Copy to a sibling then rename, so a crash mid-copy never leaves a
        // truncated blob under the final key.
        let tmp = path.with_extension("partial");
        std::fs::copy(src, &tmp).err_kind(ErrorKind::StorageUnavailable)?;
        std::fs::rename(&tmp, &path).err_kind(ErrorKind::StorageUnavailable)?;
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, Error> {
        Ok(self.full_path(key)?.exists())
    }

    fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, Error> {
        // Local blobs need no signature; the ttl is part of the contract but
        // carries no meaning for file URLs.
        let path = self.full_path(key)?;
        if !path.exists() {
            bail!(NotFound, msg("no blob at {key}"));
        }
        let _ = ttl;
        Ok(format!("file://{}", path.display()))
    }
}
