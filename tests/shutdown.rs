// Graceful shutdown against a real listener: in-flight requests and
// background tasks are drained within their budgets.
mod common;

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use axum::{Router, routing::get};
    use cinedex::{
        BackgroundTasks, GracefulShutdown, build_router,
        config::TimeoutConfig,
        serve,
        utils::{ShutdownError, ShutdownReason},
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        sync::{Notify, oneshot},
    };

    use crate::common::{TestApp, quiet_config};

    async fn raw_get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_serves_over_tcp_and_stops_cleanly() {
        let app = TestApp::new(quiet_config());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let shutdown = Arc::new(GracefulShutdown::with_timeouts(
            Duration::from_secs(5),
            Duration::from_secs(5),
        ));
        let server = {
            let shutdown = shutdown.clone();
            let tasks = app.state.tasks.clone();
            let router = app.router.clone();
            tokio::spawn(async move {
                serve(listener, router, &TimeoutConfig::default(), &shutdown, &tasks).await
            })
        };

        let response = raw_get(addr, "/v1/healthcheck").await;
        assert!(response.starts_with("HTTP/1.1 200"), "got {response}");
        assert!(response.contains("\"status\":\"available\""));

        assert!(shutdown.trigger_shutdown(ShutdownReason::Requested));
        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server should stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_waits_for_background_tasks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = Arc::new(GracefulShutdown::with_timeouts(
            Duration::from_secs(5),
            Duration::from_secs(30),
        ));
        let tasks = BackgroundTasks::new();

        let (release_tx, release_rx) = oneshot::channel::<()>();
        tasks.run("held_open", async move {
            let _ = release_rx.await;
            Ok::<_, eyre::Report>(())
        });

        let router = build_router(TestApp::new(quiet_config()).state);
        let server = {
            let shutdown = shutdown.clone();
            let tasks = tasks.clone();
            tokio::spawn(async move {
                serve(listener, router, &TimeoutConfig::default(), &shutdown, &tasks).await
            })
        };

        shutdown.trigger_shutdown(ShutdownReason::Requested);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!server.is_finished(), "server returned with a task outstanding");
        assert_eq!(tasks.outstanding(), 1);

        release_tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server should stop once tasks finish")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(tasks.outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_background_drain_budget_is_enforced() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = Arc::new(GracefulShutdown::with_timeouts(
            Duration::from_secs(5),
            Duration::from_millis(200),
        ));
        let tasks = BackgroundTasks::new();
        tasks.run("never_finishes", async {
            std::future::pending::<()>().await;
            Ok::<_, eyre::Report>(())
        });

        let router = build_router(TestApp::new(quiet_config()).state);
        let server = {
            let shutdown = shutdown.clone();
            let tasks = tasks.clone();
            tokio::spawn(async move {
                serve(listener, router, &TimeoutConfig::default(), &shutdown, &tasks).await
            })
        };

        shutdown.trigger_shutdown(ShutdownReason::Requested);
        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("drain budget should bound shutdown")
            .unwrap();
        assert!(matches!(
            result,
            Err(ShutdownError::BackgroundDrainTimeout { outstanding: 1, .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_grace_period_exceeded_by_slow_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(GracefulShutdown::with_timeouts(
            Duration::from_millis(200),
            Duration::from_secs(5),
        ));
        let tasks = BackgroundTasks::new();

        let started = Arc::new(Notify::new());
        let router = Router::new().route(
            "/slow",
            get({
                let started = started.clone();
                move || async move {
                    started.notify_one();
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    "done"
                }
            }),
        );
        let server = {
            let shutdown = shutdown.clone();
            let tasks = tasks.clone();
            tokio::spawn(async move {
                serve(listener, router, &TimeoutConfig::default(), &shutdown, &tasks).await
            })
        };

        let client = tokio::spawn(async move { raw_get(addr, "/slow").await });
        started.notified().await;

        shutdown.trigger_shutdown(ShutdownReason::Terminate);
        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("grace period should bound shutdown")
            .unwrap();
        assert!(matches!(result, Err(ShutdownError::GracePeriodExceeded(_))));
        client.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_second_trigger_is_ignored() {
        let shutdown = GracefulShutdown::new();
        let mut token = shutdown.shutdown_token();

        assert!(shutdown.trigger_shutdown(ShutdownReason::Interrupt));
        assert!(!shutdown.trigger_shutdown(ShutdownReason::Terminate));
        assert_eq!(token.wait_for_shutdown().await, ShutdownReason::Interrupt);

        // Late subscribers still observe the shutdown and its real cause
        let mut late = shutdown.shutdown_token();
        assert!(late.is_shutdown_initiated());
        assert_eq!(late.wait_for_shutdown().await, ShutdownReason::Interrupt);
    }
}
