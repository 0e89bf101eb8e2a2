//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 请求去重集成测试

#[path = "../common/mod.rs"]
mod common;

use common::{setup_logging, RecordingTransport};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tripcache::config::OptimizerConfig;
use tripcache::error::RequestError;
use tripcache::optimizer::{Method, RequestOptimizer, RequestOptions};

/// 三个同时发出、去重键相同的请求只产生一次网络调用
#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_share_one_call() {
    setup_logging();
    let transport = Arc::new(RecordingTransport::with_delay(Duration::from_millis(50)));
    let optimizer = RequestOptimizer::new(transport.clone(), &OptimizerConfig::default());

    let request = || {
        let optimizer = optimizer.clone();
        async move {
            optimizer
                .optimized_request::<Value>(
                    "/search",
                    RequestOptions::new(Method::Get)
                        .with_data(json!({"q": "paris"}))
                        .with_dedupe_key("q=paris"),
                )
                .await
        }
    };

    let (a, b, c) = tokio::join!(request(), request(), request());
    assert_eq!(transport.calls(), 1);
    let a = a.unwrap();
    assert_eq!(a, b.unwrap());
    assert_eq!(a, c.unwrap());
    assert_eq!(a["endpoint"], "/search");

    let stats = optimizer.stats().await;
    assert_eq!(stats.deduped_count, 2);
    assert_eq!(stats.total_requests, 3);
}

/// 完成后去重表被清空，后续相同请求重新发出
#[tokio::test(start_paused = true)]
async fn test_completed_request_is_not_reused() {
    let transport = Arc::new(RecordingTransport::new());
    let optimizer = RequestOptimizer::new(transport.clone(), &OptimizerConfig::default());
    let options = || RequestOptions::new(Method::Get).with_dedupe_key("q=rome");

    let _: Value = optimizer.optimized_request("/search", options()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    let _: Value = optimizer.optimized_request("/search", options()).await.unwrap();
    assert_eq!(transport.calls(), 2);
}

/// 所有附加的调用方得到相同的失败
#[tokio::test(start_paused = true)]
async fn test_shared_failure_reaches_every_caller() {
    let transport = Arc::new(RecordingTransport::failing(RequestError::from_status(
        404, "not found",
    )));
    let optimizer = RequestOptimizer::new(transport.clone(), &OptimizerConfig::default());

    let request = || {
        let optimizer = optimizer.clone();
        async move {
            optimizer
                .optimized_request::<Value>("/trips/404", RequestOptions::new(Method::Get))
                .await
        }
    };
    let (a, b) = tokio::join!(request(), request());
    assert_eq!(transport.calls(), 1);
    assert_eq!(a, Err(RequestError::from_status(404, "not found")));
    assert_eq!(a, b);
}

/// 未指定去重键时按方法、端点和请求体区分
#[tokio::test(start_paused = true)]
async fn test_default_key_distinguishes_bodies() {
    let transport = Arc::new(RecordingTransport::with_delay(Duration::from_millis(10)));
    let optimizer = RequestOptimizer::new(transport.clone(), &OptimizerConfig::default());

    let request = |city: &'static str| {
        let optimizer = optimizer.clone();
        async move {
            optimizer
                .optimized_request::<Value>(
                    "/search",
                    RequestOptions::new(Method::Post).with_data(json!({"q": city})),
                )
                .await
        }
    };
    let (a, b, c) = tokio::join!(request("paris"), request("paris"), request("rome"));
    assert_eq!(transport.calls(), 2);
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(c.unwrap()["body"]["q"], "rome");
}

/// 调用方放弃等待不会中断共享请求
#[tokio::test(start_paused = true)]
async fn test_dropped_caller_does_not_cancel_shared_call() {
    let transport = Arc::new(RecordingTransport::with_delay(Duration::from_millis(100)));
    let optimizer = RequestOptimizer::new(transport.clone(), &OptimizerConfig::default());
    let options = || RequestOptions::new(Method::Get).with_dedupe_key("trip:42");

    let impatient = tokio::time::timeout(
        Duration::from_millis(10),
        optimizer.optimized_request::<Value>("/trips/42", options()),
    )
    .await;
    assert!(impatient.is_err());

    let patient: Value = optimizer
        .optimized_request("/trips/42", options())
        .await
        .unwrap();
    assert_eq!(patient["endpoint"], "/trips/42");
    assert_eq!(transport.calls(), 1);
}
