//! Two nodes bouncing a counter over the loopback transport, driven by one
//! executor. Stops after `ROUNDS` round trips or on Ctrl-C.

use spinrt::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

const ROUNDS: u32 = 10;

#[derive(Debug, Clone)]
struct Ball {
    hits: u32,
}

pub fn main() -> anyhow::Result<()> {
    // SPINRT_* variables tune the runtime, LOG_* the logger
    let mut cfg = RuntimeConfig::from_env()?;
    cfg.logger.get_or_insert_with(LoggerConfig::from_env);
    let rt = Arc::new(Runtime::new(cfg, Arc::new(LoopbackTransport::new()))?);
    rt.register_message_types([("Ball", MessageType::of::<Ball>("Ball"))]);

    let ping = rt.create_node(0);
    let pong = rt.create_node(0);
    let serve = rt.create_publisher::<Ball>(ping, "Ball", "ping", &Qos::default());
    let reply = rt.create_publisher::<Ball>(pong, "Ball", "pong", &Qos::default());
    anyhow::ensure!(
        serve != INVALID_HANDLE && reply != INVALID_HANDLE,
        "failed to build the graph"
    );

    let executor = rt.create_executor(ExecutorKind::SingleThreaded);
    rt.executor_add_node(executor, ping);
    rt.executor_add_node(executor, pong);

    {
        let rt2 = rt.clone();
        rt.create_subscription(
            pong,
            "Ball",
            "ping",
            &SubscriptionOptions::default(),
            move |ball: &Ball| {
                tracing::info!("[Pong] got hit {}", ball.hits);
                rt2.publish(reply, Ball { hits: ball.hits + 1 });
            },
        );
    }

    let rounds = Arc::new(AtomicU32::new(0));
    {
        let rt2 = rt.clone();
        let rounds = rounds.clone();
        rt.create_subscription(
            ping,
            "Ball",
            "pong",
            &SubscriptionOptions::default(),
            move |ball: &Ball| -> anyhow::Result<()> {
                let done = rounds.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::info!("[Ping] round {} back with {} hits", done, ball.hits);
                if done >= ROUNDS {
                    rt2.executor_stop(executor);
                    return Ok(());
                }
                anyhow::ensure!(
                    rt2.publish(serve, Ball { hits: ball.hits + 1 }),
                    "serve failed"
                );
                Ok(())
            },
        );
    }

    // delivery only queues the callback; it runs once the executor spins
    rt.publish(serve, Ball { hits: 0 });

    rt.executor_spin(executor);
    tracing::info!(
        "[PingPong] finished after {} rounds",
        rounds.load(Ordering::SeqCst)
    );
    rt.shutdown();
    Ok(())
}
