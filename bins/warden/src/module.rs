use tokio::sync::watch;
use tokio::task::JoinHandle;
use warden_core::cfg::Config;

#[derive(Clone)]
pub struct ModuleCtx {
    pub config: watch::Receiver<Config>,
    pub shutdown: watch::Receiver<bool>,
}

impl ModuleCtx {
    /// Follow one projection of the live config on its own channel.
    pub fn derive<T>(&self, project: fn(&Config) -> T) -> watch::Receiver<T>
    where
        T: PartialEq + Send + Sync + 'static,
    {
        let mut src = self.config.clone();
        let (tx, rx) = watch::channel(project(&src.borrow_and_update()));
        tokio::spawn(async move {
            while src.changed().await.is_ok() {
                let next = project(&src.borrow_and_update());
                tx.send_if_modified(|cur| {
                    if *cur == next {
                        return false;
                    }
                    *cur = next;
                    true
                });
                if tx.is_closed() {
                    break;
                }
            }
        });
        rx
    }
}

pub trait Module: Send + 'static {
    fn name(&self) -> &'static str;
    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>>;
}
