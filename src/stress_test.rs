use async_stream::stream;
use futures::stream::Stream;
use futures::stream::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use trellis_graph::TextDiffer;
use trellis_sync::{
    BroadcastEvent, Client, ClientConfigBuilder, LocalSave, MemoryBroadcast, MemoryRepository,
    MemoryServer, RemoteSave, Result,
};

/// Statistics collected during stress testing
#[derive(Clone, Debug)]
pub struct StressTestStats {
    pub num_clients: usize,
    pub edits_per_client: usize,
    pub server_commits: usize,
    pub total_merges: usize,
    pub edit_time: Duration,
    pub convergence_time: Option<Duration>,
    pub total_time: Duration,
    pub edits_per_second: f64,
    pub doc_len: usize,
}

impl StressTestStats {
    pub fn print(&self) {
        let convergence = match self.convergence_time {
            Some(t) => format!("{:.3}s", t.as_secs_f64()),
            None => "DID NOT CONVERGE".to_string(),
        };
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Stress Test Statistics                         ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Number of Clients:         {:>30} ║", self.num_clients);
        println!("║  Edits per Client:          {:>30} ║", self.edits_per_client);
        println!("║  Commits on Server:         {:>30} ║", self.server_commits);
        println!("║  Merge Commits Created:     {:>30} ║", self.total_merges);
        println!("║  Final Document Length:     {:>30} ║", self.doc_len);
        println!("║  Edit Phase:                {:>29}s ║", format!("{:.3}", self.edit_time.as_secs_f64()));
        println!("║  Convergence:               {:>30} ║", convergence);
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Edits/Second:              {:>30.0} ║", self.edits_per_second);
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// A single random text edit.
#[derive(Clone, Copy, Debug)]
enum Edit {
    Insert { at: usize, ch: char },
    Delete { at: usize },
}

impl Edit {
    fn apply(self, doc: &str) -> String {
        let mut chars: Vec<char> = doc.chars().collect();
        match self {
            Edit::Insert { at, ch } => chars.insert(at % (chars.len() + 1), ch),
            Edit::Delete { at } if !chars.is_empty() => {
                chars.remove(at % chars.len());
            }
            Edit::Delete { .. } => {}
        }
        chars.into_iter().collect()
    }
}

/// Generator that yields `(client index, edit)` in round-robin order
fn edit_generator(num_clients: usize, edits_per_client: usize, seed: u64) -> impl Stream<Item = (usize, Edit)> {
    stream! {
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..edits_per_client {
            for client in 0..num_clients {
                let at = rng.gen_range(0..1024);
                let edit = if rng.gen_bool(0.2) {
                    Edit::Delete { at }
                } else {
                    Edit::Insert { at, ch: rng.gen_range('a'..='z') }
                };
                yield (client, edit);
            }
        }
    }
}

fn converged(clients: &[Client<TextDiffer>]) -> bool {
    let Some(first) = clients.first() else {
        return true;
    };
    let head = first.head_ref();
    let doc = first.doc();
    clients.iter().all(|c| {
        let status = c.sync_status();
        c.head_ref() == head
            && c.doc() == doc
            && status.local_save == LocalSave::Ready
            && status.remote_save == RemoteSave::Ready
    })
}

/// Poll until every client shows the same head and document
async fn wait_for_convergence(clients: &[Client<TextDiffer>], timeout: Duration) -> Option<Duration> {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if converged(clients) {
            return Some(start.elapsed());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    None
}

async fn run_edits(clients: &[Client<TextDiffer>], edits_per_client: usize, seed: u64) -> Result<Duration> {
    let start = Instant::now();
    let mut edits = Box::pin(edit_generator(clients.len(), edits_per_client, seed));
    let mut applied = 0usize;
    while let Some((idx, edit)) = edits.next().await {
        let client = &clients[idx];
        let next = edit.apply(&client.doc().unwrap_or_default());
        client.update_doc(next, json!({ "client": idx }))?;
        applied += 1;

        // Let sync traffic interleave with the edits.
        if applied % clients.len() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        if applied % 500 == 0 {
            println!("  Edits applied: {}/{}", applied, clients.len() * edits_per_client);
        }
    }
    Ok(start.elapsed())
}

async fn collect_stats(
    clients: Vec<Client<TextDiffer>>,
    server: &MemoryServer,
    edits_per_client: usize,
    start: Instant,
    edit_time: Duration,
) -> Result<StressTestStats> {
    println!("[Phase 2/2] Waiting for convergence...");
    let convergence_time = wait_for_convergence(&clients, Duration::from_secs(60)).await;
    let total_time = start.elapsed();

    let total_merges = clients.iter().map(|c| c.merge_count()).sum();
    let doc_len = clients
        .first()
        .and_then(|c| c.doc())
        .map_or(0, |d| d.chars().count());
    let total_edits = clients.len() * edits_per_client;

    let stats = StressTestStats {
        num_clients: clients.len(),
        edits_per_client,
        server_commits: server.commits().len(),
        total_merges,
        edit_time,
        convergence_time,
        total_time,
        edits_per_second: total_edits as f64 / total_time.as_secs_f64(),
        doc_len,
    };
    for client in clients {
        client.shutdown().await?;
    }
    println!("[Phase 2/2] ✓ Completed");
    Ok(stats)
}

/// Stress test with every client on its own device, syncing through the server
pub async fn stress_test_remote(num_clients: usize, edits_per_client: usize, seed: u64) -> Result<StressTestStats> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Remote Sync Stress Test                             ║");
    println!("║  Clients: {} | Edits/Client: {} | Seed: {} ║",
             num_clients, edits_per_client, seed);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let server = MemoryServer::new();

    let mut clients = Vec::with_capacity(num_clients);
    for idx in 0..num_clients {
        let config = ClientConfigBuilder::new()
            .user_id(format!("user_{}", idx))
            .client_id(format!("client_{:03}", idx))
            .reconnect_delay(10, 200)
            .build();
        let client = Client::open(
            TextDiffer,
            Arc::new(MemoryRepository::new()),
            Some(Arc::new(server.remote())),
            None,
            config,
        )?;
        client.loaded().await;
        clients.push(client);
    }

    println!("\n[Phase 1/2] Editing...");
    let edit_time = run_edits(&clients, edits_per_client, seed).await?;
    println!("[Phase 1/2] ✓ Completed");

    collect_stats(clients, &server, edits_per_client, start, edit_time).await
}

/// Stress test with every client on one device: shared storage, one leader
/// owning the server connection
pub async fn stress_test_tabs(num_clients: usize, edits_per_client: usize, seed: u64) -> Result<StressTestStats> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Shared Device Stress Test                           ║");
    println!("║  Tabs: {} | Edits/Tab: {} | Seed: {} ║",
             num_clients, edits_per_client, seed);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let server = MemoryServer::new();
    let hub = MemoryBroadcast::<BroadcastEvent>::new();
    let repository = MemoryRepository::new();

    let mut clients = Vec::with_capacity(num_clients);
    for idx in 0..num_clients {
        let config = ClientConfigBuilder::new()
            .user_id("shared_user")
            .client_id(format!("tab_{:03}", idx))
            .election_timeout(50)
            .heartbeat_interval(50)
            .heartbeat_timeout(150)
            .build();
        let client = Client::open(
            TextDiffer,
            Arc::new(repository.share()),
            Some(Arc::new(server.remote())),
            Some(Arc::new(hub.endpoint())),
            config,
        )?;
        client.loaded().await;
        clients.push(client);
    }

    // Give the election a moment so one tab owns the connection.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let leaders = clients.iter().filter(|c| c.is_leader()).count();
    println!("  Leaders elected: {} | Server connections: {}", leaders, server.connection_count());

    println!("\n[Phase 1/2] Editing...");
    let edit_time = run_edits(&clients, edits_per_client, seed).await?;
    println!("[Phase 1/2] ✓ Completed");

    collect_stats(clients, &server, edits_per_client, start, edit_time).await
}

/// Scaling analysis over an increasing number of clients
pub async fn stress_test_scaling(max_clients: usize, step_size: usize) -> Result<()> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║    Scaling Analysis - Convergence vs Number of Clients    ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut current_clients = step_size;
    while current_clients <= max_clients {
        let stats = stress_test_remote(current_clients, 20, current_clients as u64).await?;
        stats.print();
        current_clients += step_size;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_apply() {
        assert_eq!(Edit::Insert { at: 0, ch: 'x' }.apply(""), "x");
        assert_eq!(Edit::Insert { at: 5, ch: 'x' }.apply("ab"), "abx");
        assert_eq!(Edit::Delete { at: 4 }.apply("abc"), "ac");
        assert_eq!(Edit::Delete { at: 0 }.apply(""), "");
    }

    #[tokio::test]
    async fn test_small_run_converges() {
        let stats = stress_test_remote(3, 5, 7).await.unwrap();
        assert!(stats.convergence_time.is_some());
        assert_eq!(stats.num_clients, 3);
    }
}
