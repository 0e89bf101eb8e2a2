//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了数据层的日志和链路追踪初始化。

use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::trace::TracerProvider as SdkTracerProvider;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// 初始化日志与 OpenTelemetry Tracing
///
/// 此函数应该在应用程序启动时调用一次。重复调用不会覆盖已设置的全局 subscriber。
///
/// # 参数
///
/// * `service_name` - 服务名称，用作 tracer 名称
/// * `filter` - 日志过滤表达式，为 None 时读取 `RUST_LOG`，默认 `info`
pub fn init_tracing(service_name: &str, filter: Option<&str>) {
    let env_filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    // 未配置 exporter 时 provider 为 no-op，span 仍然会传递给 fmt 层
    let provider = SdkTracerProvider::builder().build();
    global::set_tracer_provider(provider.clone());
    let tracer = provider.tracer(service_name.to_string());
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);

    let subscriber = Registry::default()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .with(telemetry);

    let _ = tracing::subscriber::set_global_default(subscriber);
}
