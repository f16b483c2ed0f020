//! 路由生命周期控制任务
//!
//! 路由策略等运行中的组件不直接启停路由，而是向控制任务提交命令；
//! 控制任务串行执行命令，避免在交换处理过程中同步等待自身路由停止。
//!
use crate::context::ContextInner;
use std::sync::Weak;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteCommand {
    Start(String),
    Stop(String),
}

/// 控制任务的命令入口
#[derive(Clone, Debug)]
pub struct RouteController {
    tx: mpsc::UnboundedSender<RouteCommand>,
}

impl RouteController {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<RouteCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// 提交命令；控制任务已结束时返回 false
    pub fn submit(&self, command: RouteCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    pub fn start_route(&self, route_id: impl Into<String>) -> bool {
        self.submit(RouteCommand::Start(route_id.into()))
    }

    pub fn stop_route(&self, route_id: impl Into<String>) -> bool {
        self.submit(RouteCommand::Stop(route_id.into()))
    }
}

pub(crate) fn spawn_controller(
    context: Weak<ContextInner>,
    mut commands: mpsc::UnboundedReceiver<RouteCommand>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    let Some(context) = context.upgrade() else { break };
                    debug!(?command, "executing route command");
                    let result = match &command {
                        RouteCommand::Start(id) => context.start_route(id).await,
                        RouteCommand::Stop(id) => context.stop_route(id).await,
                    };
                    if let Err(err) = result {
                        warn!(?command, error = %err, "route command failed");
                    }
                }
            }
        }
    })
}
