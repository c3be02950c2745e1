use crate::cache::{CanonicalPath, DatabaseHandle, HandleLease};
use crate::error::{Result, StoreError};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Who is running the current unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallerContext {
    pub id: Uuid,
    /// Stable user/session key under which the last selection is persisted.
    pub principal: String,
    /// May trigger schema migrations.
    pub privileged: bool,
}

impl CallerContext {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal: principal.into(),
            privileged: false,
        }
    }

    pub fn privileged(principal: impl Into<String>) -> Self {
        Self {
            privileged: true,
            ..Self::new(principal)
        }
    }
}

/// Database selection for one unit of work.
///
/// Passed explicitly to every operation instead of living in process-wide
/// state. Dropping it (or re-selecting) releases only this context's
/// reference; the cached handle stays open for other contexts.
#[derive(Debug)]
pub struct SessionBinding {
    context: CallerContext,
    selected: Option<CanonicalPath>,
    handle: Option<Arc<DatabaseHandle>>,
}

impl SessionBinding {
    pub fn new(context: CallerContext) -> Self {
        Self {
            context,
            selected: None,
            handle: None,
        }
    }

    pub fn context(&self) -> &CallerContext {
        &self.context
    }

    pub fn selected_path(&self) -> Option<&CanonicalPath> {
        self.selected.as_ref()
    }

    pub fn current(&self) -> Option<&Arc<DatabaseHandle>> {
        self.handle.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn bind(&mut self, path: CanonicalPath, handle: Arc<DatabaseHandle>) {
        self.selected = Some(path);
        self.handle = Some(handle);
    }

    pub fn clear(&mut self) {
        self.selected = None;
        self.handle = None;
    }

    /// Leases the bound handle for one operation.
    pub async fn lease(&self) -> Result<HandleLease> {
        match &self.handle {
            Some(handle) => handle.lease().await,
            None => Err(StoreError::NotSelected),
        }
    }
}
