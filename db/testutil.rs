// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-memory databases and row factories for tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base::clock::SimulatedClocks;
use jiff::Timestamp;
use rusqlite::Connection;

use crate::{Database, RenderSettings};

/// An in-memory database on a simulated clock starting at an arbitrary fixed
/// instant, plus factories for the rows most tests need.
pub struct TestDb {
    pub db: Arc<Database<SimulatedClocks>>,
    pub clocks: SimulatedClocks,
    upload_seq: AtomicU64,
}

impl TestDb {
    pub fn new() -> Self {
        let clocks = SimulatedClocks::new(Timestamp::from_second(1_700_000_000).unwrap());
        let mut conn = Connection::open_in_memory().unwrap();
        crate::init(&mut conn).unwrap();
        TestDb {
            db: Arc::new(Database::from_conn(conn, clocks.clone()).unwrap()),
            clocks,
            upload_seq: AtomicU64::new(0),
        }
    }

    pub fn add_user(&self, plan: &str, credits: i64) -> i64 {
        self.db.insert_user(plan, credits).unwrap()
    }

    pub fn add_upload(&self, user_id: i64) -> i64 {
        let n = self.upload_seq.fetch_add(1, Ordering::Relaxed);
        self.db
            .insert_upload(
                user_id,
                &format!("users/{user_id}/videos/source-{n}.mp4"),
                "source.mp4",
            )
            .unwrap()
    }

    pub fn add_job(&self, upload_id: i64) -> i64 {
        self.add_job_with(upload_id, &RenderSettings::default())
    }

    pub fn add_job_with(&self, upload_id: i64, settings: &RenderSettings) -> i64 {
        self.db.insert_job(upload_id, settings).unwrap()
    }
}

impl Default for TestDb {
    fn default() -> Self {
        TestDb::new()
    }
}
