//! In-memory stand-ins for the AWS backed traits.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::env::{Env, EnvStore};
use crate::metrics::{MetricSink, Status};
use crate::s3::{LogSink, S3Object};

#[derive(Debug, Default)]
pub struct FakeEnvStore {
    records: Mutex<HashMap<String, Env>>,
    failing: AtomicBool,
}

impl FakeEnvStore {
    pub fn insert(&self, function_name: &str, env: Env) {
        self.records
            .lock()
            .unwrap()
            .insert(function_name.to_owned(), env);
    }

    pub fn record(&self, function_name: &str) -> Option<Env> {
        self.records.lock().unwrap().get(function_name).cloned()
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("configuration table is down");
        }
        Ok(())
    }
}

#[async_trait]
impl EnvStore for FakeEnvStore {
    async fn get(&self, function_name: &str) -> Result<Option<Env>> {
        self.check()?;
        Ok(self.record(function_name))
    }

    async fn put(&self, function_name: &str, env: &Env) -> Result<()> {
        self.check()?;
        self.insert(function_name, env.clone());
        Ok(())
    }

    async fn delete(&self, function_name: &str) -> Result<()> {
        self.check()?;
        self.records.lock().unwrap().remove(function_name);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeMetricSink {
    statuses: Mutex<Vec<(String, Status)>>,
    failing: AtomicBool,
}

impl FakeMetricSink {
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn statuses(&self) -> Vec<Status> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[async_trait]
impl MetricSink for FakeMetricSink {
    async fn put_status(&self, metric_name: &str, status: Status) -> Result<()> {
        self.statuses
            .lock()
            .unwrap()
            .push((metric_name.to_owned(), status));
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("CloudWatch is down");
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeLogSink {
    written: Mutex<Vec<(S3Object, String)>>,
    failing: AtomicBool,
}

impl FakeLogSink {
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    /// Log documents written so far. Failed writes are not recorded.
    pub fn written(&self) -> Vec<(S3Object, String)> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogSink for FakeLogSink {
    async fn put_logs(&self, dst: &S3Object, contents: String) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("S3 is down");
        }
        self.written.lock().unwrap().push((dst.clone(), contents));
        Ok(())
    }
}
