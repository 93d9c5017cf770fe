use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use sql_exporter::{
    exposition::{self, CONTENT_TYPE, Server},
    gauge::GaugeStore,
    row::{Row, Value},
    runner::{self, QueryRunner},
    scheduler::Scheduler,
    source::{self, Source, SqlSource},
};

/// A source whose result set the test swaps between ticks. `None` fails the
/// query.
#[derive(Debug, Clone, Default)]
struct Table {
    rows: Arc<Mutex<Option<Vec<Row>>>>,
}

impl Table {
    fn set(&self, rows: Option<Vec<Row>>) {
        *self.rows.lock().expect("table poisoned") = rows;
    }
}

#[async_trait]
impl Source for Table {
    async fn fetch(&mut self, _statement: &str) -> Result<Vec<Row>, source::Error> {
        self.rows
            .lock()
            .expect("table poisoned")
            .clone()
            .ok_or_else(|| source::Error::Sqlx(sqlx::Error::Protocol("gone away".to_string())))
    }
}

fn host_row(host: &str, cpu: f64) -> Row {
    Row::from_iter([("host", Value::from(host)), ("cpu", Value::from(cpu))])
}

fn load_query() -> runner::Config {
    runner::Config {
        name: "load".to_string(),
        interval_seconds: 15.0,
        statement: "SELECT host, cpu FROM load".to_string(),
        value_columns: vec!["cpu".to_string()],
        timeout_seconds: None,
    }
}

async fn start_server(
    store: Arc<GaugeStore>,
) -> (SocketAddr, sql_exporter_signal::Broadcaster, tokio::task::JoinHandle<()>) {
    let (watcher, broadcaster) = sql_exporter_signal::signal();
    let config = exposition::Config {
        binding_addr: "127.0.0.1:0".parse().expect("valid address"),
        concurrent_requests_max: 8,
    };
    let server = Server::bind(config, store, None, watcher)
        .await
        .expect("could not bind exposition endpoint");
    let addr = server.local_addr().expect("no local address");
    let handle = tokio::spawn(async move {
        server.run().await.expect("exposition endpoint failed");
    });
    (addr, broadcaster, handle)
}

async fn scrape(addr: SocketAddr) -> String {
    let response = reqwest::get(format!("http://{addr}/metrics"))
        .await
        .expect("scrape failed");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some(CONTENT_TYPE)
    );
    response.text().await.expect("body was not text")
}

#[tokio::test]
async fn scrapes_follow_query_results() {
    let store = Arc::new(GaugeStore::new());
    let (addr, shutdown, handle) = start_server(Arc::clone(&store)).await;

    let table = Table::default();
    let mut runner =
        QueryRunner::new(load_query(), table.clone(), Arc::clone(&store)).expect("bad config");

    table.set(Some(vec![host_row("a", 1.5), host_row("b", 2.25)]));
    runner.run_once().await;
    assert_eq!(
        scrape(addr).await,
        "# TYPE load_cpu gauge\nload_cpu{host=\"a\"} 1.5\nload_cpu{host=\"b\"} 2.25\n"
    );

    table.set(Some(vec![host_row("a", 3.0)]));
    runner.run_once().await;
    assert_eq!(
        scrape(addr).await,
        "# TYPE load_cpu gauge\nload_cpu{host=\"a\"} 3\n"
    );

    table.set(None);
    runner.run_once().await;
    assert_eq!(scrape(addr).await, "# TYPE load_cpu gauge\n");

    shutdown.signal();
    handle.await.expect("server task panicked");
}

#[tokio::test]
async fn non_get_is_rejected() {
    let store = Arc::new(GaugeStore::new());
    let (addr, shutdown, handle) = start_server(store).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/metrics"))
        .send()
        .await
        .expect("request failed");
    assert_eq!(response.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);

    shutdown.signal();
    handle.await.expect("server task panicked");
}

#[tokio::test]
async fn scheduled_sqlite_query_is_exported() {
    let store = Arc::new(GaugeStore::new());
    let (addr, server_shutdown, handle) = start_server(Arc::clone(&store)).await;

    let source = SqlSource::connect("sqlite::memory:")
        .await
        .expect("could not open in-memory sqlite");
    let mut query = load_query();
    query.interval_seconds = 0.05;
    query.statement = "SELECT 'a' AS host, 0.5 AS cpu UNION ALL SELECT 'b', 4".to_string();
    let runner = QueryRunner::new(query, source, Arc::clone(&store)).expect("bad config");

    let (watcher, broadcaster) = sql_exporter_signal::signal();
    let mut scheduler = Scheduler::new(watcher);
    scheduler.schedule(runner.interval(), Box::new(runner));
    let scheduled = tokio::spawn(scheduler.run());

    tokio::time::sleep(Duration::from_millis(200)).await;
    broadcaster.signal();
    scheduled
        .await
        .expect("scheduler task panicked")
        .expect("scheduler failed");

    assert_eq!(
        scrape(addr).await,
        "# TYPE load_cpu gauge\nload_cpu{host=\"a\"} 0.5\nload_cpu{host=\"b\"} 4\n"
    );

    server_shutdown.signal();
    handle.await.expect("server task panicked");
}
