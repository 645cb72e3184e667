// ── Admission control ──
//
// One `Admission` per service class, owned by the worker's environment and
// handed to every service of that class. Its semaphore is the only
// backpressure on how many services of a class may be mid-flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::config::AdmissionLimits;
use crate::error::CoreError;
use crate::service::names;

#[derive(Debug)]
pub struct Admission {
    class: &'static str,
    limit: Option<usize>,
    semaphore: Arc<Semaphore>,
    active: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicU64,
}

impl Admission {
    /// `None` admits without bound. A zero limit is raised to one.
    pub fn new(class: &'static str, limit: Option<usize>) -> Arc<Self> {
        let limit = limit.map(|n| n.max(1));
        let permits = limit.unwrap_or(Semaphore::MAX_PERMITS);
        Arc::new(Self {
            class,
            limit,
            semaphore: Arc::new(Semaphore::new(permits)),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            total: AtomicU64::new(0),
        })
    }

    pub fn class(&self) -> &'static str {
        self.class
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Holders right now.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous holders ever observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn total_acquired(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Wait for a slot. The slot is released when the permit drops.
    pub async fn acquire(self: &Arc<Self>) -> Result<AdmissionPermit, CoreError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| CoreError::Internal(format!("admission '{}' closed", self.class)))?;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        trace!(class = self.class, active = now, "admission slot taken");
        Ok(AdmissionPermit {
            admission: Arc::clone(self),
            _permit: permit,
        })
    }
}

/// A held admission slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    admission: Arc<Admission>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let left = self.admission.active.fetch_sub(1, Ordering::SeqCst) - 1;
        trace!(class = self.admission.class, active = left, "admission slot released");
    }
}

/// Per-worker admission registry, keyed by service class.
#[derive(Debug, Default)]
pub struct Admissions {
    classes: DashMap<&'static str, Arc<Admission>>,
}

impl Admissions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ceilings for the AP join and client association classes.
    pub fn from_limits(limits: &AdmissionLimits) -> Self {
        let admissions = Self::new();
        admissions.set_limit(names::AP_DISCOVER, limits.ap_join);
        admissions.set_limit(names::CLIENT_ASSOCIATION, limits.client_association);
        admissions
    }

    /// Replace the admission of `class`. Existing holders keep their slots
    /// in the old admission.
    pub fn set_limit(&self, class: &'static str, limit: Option<usize>) {
        self.classes.insert(class, Admission::new(class, limit));
    }

    /// Admission of `class`, unbounded if never configured.
    pub fn get(&self, class: &'static str) -> Arc<Admission> {
        Arc::clone(
            self.classes
                .entry(class)
                .or_insert_with(|| Admission::new(class, None))
                .value(),
        )
    }
}
