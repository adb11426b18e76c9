pub mod auth;
pub mod http;
pub mod memory;

use async_trait::async_trait;

use crate::engine::error::CaseError;
use crate::engine::types::{CaseDetails, RawCase};
use crate::query::SearchRequest;

pub use auth::{CredentialProvider, EnvCredentials, StaticCredentials, SystemCredentials};

/// One page of search results.
///
/// `has_more` only says the store may hold further matches. A page shorter
/// than the requested size is not a last page: stores are free to cap it.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub cases: Vec<RawCase>,
    /// Records on this page that could not be decoded, as per-case failures.
    pub rejected: Vec<CaseError>,
    /// Total matches across all pages, when the store reports it.
    pub total: Option<u64>,
    pub has_more: bool,
}

impl SearchPage {
    /// Highest case id on the page, decoded or not. Paging resumes after it.
    pub fn last_id(&self) -> Option<i64> {
        self.cases
            .iter()
            .map(|c| c.id)
            .chain(self.rejected.iter().filter_map(CaseError::case_id))
            .max()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty() && self.rejected.is_empty()
    }
}

/// Read side of the external case repository.
#[async_trait]
pub trait CaseStore: Send + Sync {
    /// Take the run lease for a task. Fails with `CaseError::Conflict` while
    /// another run of the same task still holds it.
    async fn acquire_lease(&self, creds: &SystemCredentials, task: &str) -> Result<(), CaseError>;

    /// Give the lease back. Best effort.
    async fn release_lease(&self, creds: &SystemCredentials, task: &str) -> Result<(), CaseError>;

    /// Fetch one page of cases matching the request.
    async fn search(
        &self,
        creds: &SystemCredentials,
        request: &SearchRequest,
    ) -> Result<SearchPage, CaseError>;

    /// Fetch the current state of a single case.
    async fn fetch(&self, creds: &SystemCredentials, case_id: i64) -> Result<RawCase, CaseError>;
}

/// What an event is submitted against.
#[derive(Debug, Clone, Copy)]
pub enum SubmitTarget<'a> {
    /// Bare id: the store re-reads the case before applying the event.
    CaseId(i64),
    /// A previously fetched case: its data is submitted as-is, and the store
    /// rejects it if the case changed since the snapshot was taken.
    Snapshot(&'a CaseDetails),
}

impl SubmitTarget<'_> {
    pub fn case_id(&self) -> i64 {
        match self {
            SubmitTarget::CaseId(id) => *id,
            SubmitTarget::Snapshot(case) => case.id,
        }
    }
}

/// Write side of the external case repository.
#[async_trait]
pub trait EventSubmitter: Send + Sync {
    /// Submit a named event. Returns the case as it stands afterwards.
    async fn submit(
        &self,
        creds: &SystemCredentials,
        target: SubmitTarget<'_>,
        event_id: &str,
    ) -> Result<RawCase, CaseError>;
}
