//! The seam to the graph view subsystem.
//!
//! A view turns an item of the graph into documents of a collection; a set
//! executed "on a view" then queries that collection. Only the contract
//! lives here.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::persist::Database;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewParams {
    pub view_name: String,
    pub item_key: String,
    /// Collection the view writes to. Filled with the first query's
    /// collection before the runner is called when left empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_collection: Option<String>,
}

pub trait ViewRunner: Send + Sync {
    /// Materialises the view for `view.item_key` into
    /// `view.results_collection`.
    fn run(&self, db: &Database, view: &ViewParams) -> Result<()>;
}
