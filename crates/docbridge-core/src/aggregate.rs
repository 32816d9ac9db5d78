//! Aggregation pipelines.
//!
//! A leading run of `Match`, `Sort`, `Skip` and `Limit` stages is pushed down
//! into a backend `find`; whatever follows runs over the fetched documents.

use crate::filter::Filter;
use crate::json::{sort_maps, Map};
use crate::options::{FindOptions, Stage};
use serde_json::Value;

/// Pushed-down part of a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan<'a> {
    pub filter: Filter,
    pub options: FindOptions,
    /// Stages evaluated in memory
    pub rest: &'a [Stage],
}

/// Fold the longest pushable prefix of `stages` into a find.
pub fn plan(stages: &[Stage]) -> Plan<'_> {
    let mut filter = Filter::all();
    let mut options = FindOptions::default();
    let mut consumed = 0;

    for stage in stages {
        let pushed = match stage {
            Stage::Match(f) if options.sort.is_empty() && options.skip.is_none() && options.limit.is_none() => {
                filter = filter.and(f.clone());
                true
            }
            Stage::Sort(keys) if options.sort.is_empty() && options.skip.is_none() && options.limit.is_none() => {
                options.sort = keys.clone();
                true
            }
            Stage::Skip(n) if options.limit.is_none() => {
                options.skip = Some(options.skip.unwrap_or(0) + n);
                true
            }
            Stage::Limit(n) => {
                options.limit = Some(options.limit.map_or(*n, |current| current.min(*n)));
                true
            }
            _ => false,
        };
        if !pushed {
            break;
        }
        consumed += 1;
    }

    Plan {
        filter,
        options,
        rest: &stages[consumed..],
    }
}

/// Run stages over materialized documents.
pub fn apply_stages(mut docs: Vec<Map>, stages: &[Stage]) -> Vec<Map> {
    for stage in stages {
        docs = match stage {
            Stage::Match(filter) => docs.into_iter().filter(|d| filter.matches(d)).collect(),
            Stage::Sort(keys) => {
                sort_maps(&mut docs, keys);
                docs
            }
            Stage::Skip(n) => docs.into_iter().skip(*n as usize).collect(),
            Stage::Limit(n) => docs.into_iter().take(*n as usize).collect(),
            Stage::Project(projection) => {
                for doc in docs.iter_mut() {
                    projection.apply(doc);
                }
                docs
            }
            Stage::Count(name) => {
                let mut out = Map::new();
                out.insert(name.clone(), Value::from(docs.len() as u64));
                vec![out]
            }
        };
    }
    docs
}
