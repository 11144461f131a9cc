//! Hostname domain: which addresses a name resolved to and which clients
//! asked for it, per chunk.

use super::{BlacklistLookup, UniqueIp};
use crate::change::{Change, ChangeSet};
use crate::config::FlowsinkConfig;
use crate::document::{ChunkId, Document};
use crate::gateway::{Database, IndexSpec};
use crate::merge::merge_documents;
use crate::pipeline::{PipelineStage, StageReport};
use crate::writer::{BulkWriter, WriterReport};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

pub const HOSTNAMES_COLLECTION: &str = "hostnames";

const REVERSE_LOOKUP_SUFFIX: &str = "in-addr.arpa";

/// Parsed DNS activity for one hostname.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostnameInput {
    pub host: String,
    /// Answers seen for the name
    pub resolved_ips: Vec<UniqueIp>,
    /// Clients that queried the name
    pub client_ips: Vec<UniqueIp>,
}

impl HostnameInput {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }
}

/// Builds the hostname upserts of one chunk.
pub struct HostnameAnalyzer<L> {
    chunk: ChunkId,
    collection: String,
    lookup: L,
}

impl<L: BlacklistLookup> HostnameAnalyzer<L> {
    pub fn new(chunk: ChunkId, lookup: L) -> Self {
        Self {
            chunk,
            collection: HOSTNAMES_COLLECTION.to_string(),
            lookup,
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// One upsert on `{host}`, or nothing for empty and reverse-lookup names.
    ///
    /// A failed blacklist lookup is logged and the host recorded as not
    /// blacklisted.
    pub fn analyze(&self, input: HostnameInput) -> anyhow::Result<Option<ChangeSet>> {
        if input.host.is_empty() || input.host.ends_with(REVERSE_LOOKUP_SUFFIX) {
            return Ok(None);
        }

        let history = history_update(&input, self.chunk)?;
        let blacklisted = match self.lookup.is_blacklisted(&input.host) {
            Ok(flag) => flag,
            Err(err) => {
                warn!(host = %input.host, error = %format!("{err:#}"), "Failed blacklist lookup");
                false
            }
        };
        let update = merge_documents([history, blacklist_update(blacklisted)])
            .with_context(|| format!("merging updates for `{}`", input.host))?;

        let mut selector = Document::new();
        selector.insert("host".into(), Value::from(input.host));
        Ok(Some(ChangeSet::single(
            self.collection.clone(),
            Change::upsert(selector, update),
        )))
    }
}

/// Stamp the chunk and append this chunk's resolution history entry.
fn history_update(input: &HostnameInput, chunk: ChunkId) -> anyhow::Result<Document> {
    let entry = crate::document! {
        "ips": serde_json::to_value(distinct(&input.resolved_ips))?,
        "src_ips": serde_json::to_value(distinct(&input.client_ips))?,
        "cid": chunk,
    };
    Ok(crate::document! {
        "$set": { "cid": chunk },
        "$push": { "dat": { "$each": [entry] } },
    })
}

fn blacklist_update(blacklisted: bool) -> Document {
    crate::document! { "$set": { "blacklisted": blacklisted } }
}

fn distinct(ips: &[UniqueIp]) -> Vec<&UniqueIp> {
    let mut seen: Vec<&UniqueIp> = Vec::with_capacity(ips.len());
    for ip in ips {
        if !seen.contains(&ip) {
            seen.push(ip);
        }
    }
    seen
}

/// Indexes of the hostnames collection.
pub fn hostname_indexes() -> Vec<IndexSpec> {
    vec![
        IndexSpec::ascending("host").unique(),
        IndexSpec::new([("dat.ips.ip", 1), ("dat.ips.network_uuid", 1)]),
        IndexSpec::ascending("dat.cid"),
    ]
}

/// Totals of one domain upsert run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub stage: StageReport,
    pub writer: WriterReport,
}

/// Persist `inputs` into the hostnames collection of `database`.
///
/// Creates the collection and its indexes when missing, runs the analysis
/// stage into a bulk writer and closes the cascade before returning.
pub fn upsert_hostnames<L, I>(
    database: &Database,
    inputs: I,
    config: &FlowsinkConfig,
    lookup: L,
) -> anyhow::Result<UpsertSummary>
where
    L: BlacklistLookup + 'static,
    I: IntoIterator<Item = HostnameInput>,
{
    database
        .ensure_collection(HOSTNAMES_COLLECTION, &hostname_indexes())
        .context("creating hostnames collection")?;

    let writer = Arc::new(BulkWriter::start(database, "hostname", config.writer.clone())?);
    let analyzer = HostnameAnalyzer::new(config.rolling.current_chunk, lookup);
    let stage = PipelineStage::into_sink(
        "hostname",
        &config.pipeline,
        move |input: HostnameInput| analyzer.analyze(input),
        Arc::clone(&writer),
    )?;

    for input in inputs {
        stage.collect(input)?;
    }

    // closing the stage closes the writer
    let stage_report = stage.close();
    let writer_report = writer.close();
    info!(
        chunk = config.rolling.current_chunk.0,
        hosts = stage_report.received,
        written = writer_report.applied,
        "Hostname analysis complete"
    );
    Ok(UpsertSummary {
        stage: stage_report,
        writer: writer_report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document;
    use serde_json::json;
    use std::collections::HashSet;

    struct FailingLookup;

    impl BlacklistLookup for FailingLookup {
        fn is_blacklisted(&self, _key: &str) -> anyhow::Result<bool> {
            anyhow::bail!("blacklist database unreachable")
        }
    }

    fn input() -> HostnameInput {
        HostnameInput {
            host: "example.com".into(),
            resolved_ips: vec![
                UniqueIp::new("93.184.216.34", "ffff", "public"),
                UniqueIp::new("93.184.216.34", "ffff", "public"),
            ],
            client_ips: vec![UniqueIp::new("10.0.0.5", "ffff", "corp")],
        }
    }

    #[test]
    fn test_analyze_builds_single_merged_upsert() {
        let blacklist: HashSet<String> = ["example.com".to_string()].into_iter().collect();
        let analyzer = HostnameAnalyzer::new(ChunkId(3), blacklist);
        let changes = analyzer.analyze(input()).unwrap().unwrap();

        let hostnames = changes.get(HOSTNAMES_COLLECTION).unwrap();
        assert_eq!(hostnames.len(), 1);
        let change = &hostnames[0];
        assert_eq!(change.selector, document! { "host": "example.com" });
        let update = change.payload.as_ref().unwrap();
        assert_eq!(update["$set"], json!({ "cid": 3, "blacklisted": true }));
        assert_eq!(
            update["$push"]["dat"]["$each"],
            json!([{
                "ips": [{ "ip": "93.184.216.34", "network_uuid": "ffff", "network_name": "public" }],
                "src_ips": [{ "ip": "10.0.0.5", "network_uuid": "ffff", "network_name": "corp" }],
                "cid": 3,
            }])
        );
    }

    #[test]
    fn test_skips_empty_and_reverse_lookup_names() {
        let analyzer = HostnameAnalyzer::new(ChunkId(1), HashSet::<String>::new());
        assert!(analyzer.analyze(HostnameInput::new("")).unwrap().is_none());
        assert!(analyzer
            .analyze(HostnameInput::new("5.0.0.10.in-addr.arpa"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_lookup_failure_records_not_blacklisted() {
        let analyzer = HostnameAnalyzer::new(ChunkId(1), FailingLookup).with_collection("dns_names");
        let changes = analyzer.analyze(input()).unwrap().unwrap();
        let change = &changes.get("dns_names").unwrap()[0];
        assert_eq!(change.payload.as_ref().unwrap()["$set"]["blacklisted"], json!(false));
    }

    #[test]
    fn test_indexes() {
        let names: Vec<String> = hostname_indexes().iter().map(IndexSpec::resolved_name).collect();
        assert_eq!(names, vec!["host_1", "dat.ips.ip_1_dat.ips.network_uuid_1", "dat.cid_1"]);
        assert!(hostname_indexes()[0].unique);
    }
}
