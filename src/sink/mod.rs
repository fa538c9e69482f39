//! # Tabular Sink Module
//!
//! Trait abstraction over the structured tabular output file.
//!
//! The capture engine emits one page per capture event: rows in chronological
//! order (one per buffered snapshot) plus page-level parameters carrying the
//! trigger metadata. Column value types form a closed set decided once when
//! the schema is defined, never per row. Array channels are laid out either
//! as per-element columns (uniform row shape) or as natively shaped arrays;
//! the layout is resolved once per sink at open time.

pub mod jsonl;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;

/// How scalar-array channels are laid out in a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArrayLayout {
    /// Pick `Columns` when all array channels share one element count,
    /// `Native` otherwise. Resolved before the schema is defined.
    #[default]
    Auto,
    /// Expand each array element into its own column (uniform row shape).
    Columns,
    /// Keep arrays natively shaped, one column per array channel.
    Native,
}

/// Resolve `Auto` into a concrete layout from the element counts of the
/// dataset's array channels. Never returns `Auto`.
#[must_use]
pub fn resolve_layout(layout: ArrayLayout, array_element_counts: &[usize]) -> ArrayLayout {
    match layout {
        ArrayLayout::Auto => {
            let uniform = array_element_counts
                .windows(2)
                .all(|pair| pair[0] == pair[1]);
            if uniform {
                ArrayLayout::Columns
            } else {
                ArrayLayout::Native
            }
        }
        other => other,
    }
}

/// Column data type, fixed at schema-definition time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    F64,
    I64,
    Bool,
    Str,
    F64Array,
}

/// A single cell or parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    F64(f64),
    I64(i64),
    Bool(bool),
    Str(String),
    F64Array(Vec<f64>),
}

impl ColumnValue {
    #[must_use]
    pub fn kind(&self) -> ColumnKind {
        match self {
            ColumnValue::F64(_) => ColumnKind::F64,
            ColumnValue::I64(_) => ColumnKind::I64,
            ColumnValue::Bool(_) => ColumnKind::Bool,
            ColumnValue::Str(_) => ColumnKind::Str,
            ColumnValue::F64Array(_) => ColumnKind::F64Array,
        }
    }

    /// JSON rendering used by the JSONL adapter.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ColumnValue::F64(v) => serde_json::json!(v),
            ColumnValue::I64(v) => serde_json::json!(v),
            ColumnValue::Bool(v) => serde_json::json!(v),
            ColumnValue::Str(v) => serde_json::json!(v),
            ColumnValue::F64Array(v) => serde_json::json!(v),
        }
    }
}

/// One column in the page schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
    pub units: Option<String>,
}

impl ColumnSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            units: None,
        }
    }

    #[must_use]
    pub fn with_units(mut self, units: Option<String>) -> Self {
        self.units = units;
        self
    }
}

/// Schema for one dataset's pages, defined once at open.
#[derive(Debug, Clone, PartialEq)]
pub struct PageSchema {
    pub dataset: String,
    pub columns: Vec<ColumnSpec>,
}

/// Trait for the structured tabular output.
///
/// One sink per dataset; only the owning dataset ever touches its handle.
/// Write failures are fatal to the logger, so implementations should report
/// them rather than swallow them.
#[async_trait]
pub trait TabularSink: Send {
    /// Define the schema and prepare the output for pages.
    async fn open(&mut self, schema: PageSchema) -> Result<()>;

    /// Begin a new in-memory page with a row-capacity hint.
    fn start_page(&mut self, row_capacity_hint: usize);

    /// Set one row of the current page. Rows are indexed in chronological
    /// order starting at zero.
    fn set_row(&mut self, row_index: usize, values: Vec<ColumnValue>) -> Result<()>;

    /// Set a page-level parameter (written once per page, not per row).
    fn set_parameter(&mut self, name: &str, value: ColumnValue);

    /// Persist the current page.
    async fn write_page(&mut self) -> Result<()>;

    /// Update the liveness marker without writing data.
    async fn touch(&mut self) -> Result<()>;

    /// Flush and release the output.
    async fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use crate::error::GlitchLoggerError;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    /// One page recorded by the mock sink.
    #[derive(Debug, Clone, Default)]
    pub struct MockPage {
        pub rows: Vec<Vec<ColumnValue>>,
        pub parameters: BTreeMap<String, ColumnValue>,
    }

    #[derive(Debug, Default)]
    pub struct MockSinkState {
        pub schema: Option<PageSchema>,
        pub pages: Vec<MockPage>,
        pub touches: usize,
        pub closed: bool,
        pub fail_writes: bool,
    }

    /// In-memory sink recording everything written to it.
    ///
    /// Clones share state, so a test can keep a clone for assertions while
    /// the controller owns the original.
    #[derive(Debug, Clone, Default)]
    pub struct MockSink {
        state: Arc<Mutex<MockSinkState>>,
        current: MockPage,
    }

    impl MockSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn state(&self) -> Arc<Mutex<MockSinkState>> {
            Arc::clone(&self.state)
        }

        pub fn pages(&self) -> Vec<MockPage> {
            self.state.lock().unwrap().pages.clone()
        }

        pub fn touches(&self) -> usize {
            self.state.lock().unwrap().touches
        }

        pub fn set_fail_writes(&self, fail: bool) {
            self.state.lock().unwrap().fail_writes = fail;
        }
    }

    #[async_trait]
    impl TabularSink for MockSink {
        async fn open(&mut self, schema: PageSchema) -> Result<()> {
            self.state.lock().unwrap().schema = Some(schema);
            Ok(())
        }

        fn start_page(&mut self, row_capacity_hint: usize) {
            self.current = MockPage {
                rows: Vec::with_capacity(row_capacity_hint),
                parameters: BTreeMap::new(),
            };
        }

        fn set_row(&mut self, row_index: usize, values: Vec<ColumnValue>) -> Result<()> {
            if row_index != self.current.rows.len() {
                return Err(GlitchLoggerError::Sink(format!(
                    "non-sequential row index {} (expected {})",
                    row_index,
                    self.current.rows.len()
                )));
            }
            self.current.rows.push(values);
            Ok(())
        }

        fn set_parameter(&mut self, name: &str, value: ColumnValue) {
            self.current.parameters.insert(name.to_string(), value);
        }

        async fn write_page(&mut self) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail_writes {
                return Err(GlitchLoggerError::Sink("mock write failure".to_string()));
            }
            state.pages.push(std::mem::take(&mut self.current));
            Ok(())
        }

        async fn touch(&mut self) -> Result<()> {
            self.state.lock().unwrap().touches += 1;
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.state.lock().unwrap().closed = true;
            Ok(())
        }
    }
}
