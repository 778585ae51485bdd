use anyhow::Result;
use serde::Serialize;

use super::{round2, TraceDb};

/// How often custom components were rebuilt from the recycle pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ComponentReuseResult {
    pub total_builds: i64,
    pub recycled_builds: i64,
    pub reusability_ratio: f64,
}

impl TraceDb {
    pub fn component_reuse(&self) -> Result<ComponentReuseResult> {
        self.require_tables(&["callstack"])?;
        let count = |pattern: &str| -> Result<i64> {
            let n = self.connection().query_row(
                &build_callstack_count_query(),
                [pattern],
                |row| row.get(0),
            )?;
            Ok(n)
        };
        let total_builds = count("%H:CustomNode:Build%")?;
        let recycled_builds = count("%H:CustomNode:BuildRecycle%")?;
        let reusability_ratio = if total_builds > 0 {
            round2(recycled_builds as f64 / total_builds as f64)
        } else {
            0.0
        };
        Ok(ComponentReuseResult {
            total_builds,
            recycled_builds,
            reusability_ratio,
        })
    }
}

fn build_callstack_count_query() -> String {
    "SELECT COUNT(*) FROM callstack WHERE name LIKE ?1".to_string()
}
