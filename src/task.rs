use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A long-running background job that stops when its token is cancelled.
#[async_trait]
pub trait Task {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// Spawns `task` onto the runtime, logging how it ended.
pub fn spawn_task(
    task: Box<dyn Task + Send>,
    cancel: CancellationToken,
) -> JoinHandle<anyhow::Result<()>> {
    let name = task.name();
    debug!("starting {} task", name);

    tokio::spawn(async move {
        let res = task.run(cancel).await;

        match &res {
            Ok(()) => debug!("{} task exited", name),
            Err(err) => error!("{} task terminated with error: {:#}", name, err),
        }

        res
    })
}
