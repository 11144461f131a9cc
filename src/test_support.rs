#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::time::{Duration, Instant};

use flowsink::analysis::{HostnameInput, UniqueIp};
use flowsink::{document, Change, ChangeSet, ChunkId, Document, MemoryStore};

const NETWORKS: [(&str, &str); 3] = [
    ("ffffffff-ffff-ffff-ffff-ffffffffffff", "Unknown Private"),
    ("6c3bb4e5-0d1c-4ef4-9a43-a5a5d5f2a1b0", "corp"),
    ("0f4f8a9e-7c31-4d3a-8f5b-8e3d0c9c2b11", "lab"),
];

#[derive(Debug, Clone)]
pub struct GeneratedHostnames {
    pub inputs: Vec<HostnameInput>,
    pub blacklist: HashSet<String>,
}

fn random_ip(rng: &mut StdRng, private: bool) -> UniqueIp {
    let (uuid, name) = NETWORKS[rng.random_range(0..NETWORKS.len())];
    let ip = if private {
        format!("10.{}.{}.{}", rng.random_range(0..255), rng.random_range(0..255), rng.random_range(1..255))
    } else {
        format!(
            "{}.{}.{}.{}",
            rng.random_range(11..223),
            rng.random_range(0..255),
            rng.random_range(0..255),
            rng.random_range(1..255)
        )
    };
    UniqueIp::new(ip, uuid, name)
}

/// Distinct hostnames with random resolutions and clients, plus a blacklist
/// holding roughly `blacklisted_probability` of them.
pub fn generate_hostnames(count: usize, blacklisted_probability: f64, seed: u64) -> GeneratedHostnames {
    let mut rng = StdRng::seed_from_u64(seed);
    let tlds = ["com", "net", "org", "io"];
    let mut inputs = Vec::with_capacity(count);
    let mut blacklist = HashSet::new();

    for i in 0..count {
        let host = format!("host-{:06}.{}", i, tlds[rng.random_range(0..tlds.len())]);
        let resolved = (0..rng.random_range(1..4)).map(|_| random_ip(&mut rng, false)).collect();
        let clients = (0..rng.random_range(1..6)).map(|_| random_ip(&mut rng, true)).collect();
        if rng.random_bool(blacklisted_probability) {
            blacklist.insert(host.clone());
        }
        inputs.push(HostnameInput {
            host,
            resolved_ips: resolved,
            client_ips: clients,
        });
    }

    GeneratedHostnames { inputs, blacklist }
}

/// `count` change sets, each upserting one distinct host into a random
/// destination of `destinations` and stamping `chunk`.
pub fn generate_change_sets(count: usize, destinations: &[&str], chunk: ChunkId, seed: u64) -> Vec<ChangeSet> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let destination = destinations[rng.random_range(0..destinations.len())];
            let ip = format!("10.{}.{}.{}", (i >> 16) & 0xff, (i >> 8) & 0xff, i & 0xff);
            let bytes: u64 = rng.random_range(1..10_000);
            let change = Change::upsert(
                document! { "ip": ip.clone(), "network_uuid": NETWORKS[0].0 },
                document! {
                    "$set": { "cid": chunk },
                    "$push": { "dat": { "bytes": bytes, "cid": chunk } },
                },
            );
            ChangeSet::single(destination, change)
        })
        .collect()
}

/// Seed `collection` with `solo` documents written only by `chunk` and
/// `shared` documents whose history also holds one entry of `later`.
pub fn seed_chunked_documents(
    store: &MemoryStore,
    database: &str,
    collection: &str,
    chunk: ChunkId,
    later: ChunkId,
    solo: usize,
    shared: usize,
) {
    let mut docs: Vec<Document> = Vec::with_capacity(solo + shared);
    for i in 0..solo {
        docs.push(document! {
            "ip": format!("192.168.0.{i}"),
            "cid": chunk,
            "dat": [{ "count": 1, "cid": chunk }],
        });
    }
    for i in 0..shared {
        docs.push(document! {
            "ip": format!("172.16.0.{i}"),
            "cid": later,
            "dat": [{ "count": 2, "cid": chunk }, { "count": 3, "cid": later }],
        });
    }
    if let Err(err) = store.insert_many(database, collection, docs) {
        panic!("seeding {collection}: {err}");
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
