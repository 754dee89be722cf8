use crate::config::ChatGptConfig;
use crate::error::{ChatError, ChatResult};
use crate::services::chat_client::ChatGptClient;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const QUEUE_CAPACITY: usize = 1024;

const CMD_RESET: &str = "!reset";
const RESET_REPLY: &str = "Reset conversation done.";

pub type TaskHandler = Box<dyn FnOnce(ChatResult<String>) + Send + 'static>;

/// 路由键为user_id的一次对话任务
pub struct Task {
    user_id: String,
    content: String,
    timeout: Duration,
    handler: TaskHandler,
}

impl Task {
    pub fn new(
        user_id: impl Into<String>,
        content: impl Into<String>,
        timeout: Duration,
        handler: impl FnOnce(ChatResult<String>) + Send + 'static,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            content: content.into(),
            timeout,
            handler: Box::new(handler),
        }
    }
}

/// 任务分发器。
///
/// 每个user_id对应一个容量1024的FIFO队列和一个常驻worker，
/// worker在该用户的首个任务到来时惰性创建，进程存活期内不回收。
/// 同一用户的回调严格按入队顺序触发，不同用户的worker并发运行。
pub struct TaskManager {
    config: ChatGptConfig,
    queues: Mutex<HashMap<String, mpsc::Sender<Task>>>,
}

impl TaskManager {
    pub fn new(config: ChatGptConfig) -> Self {
        Self {
            config,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// 入队一个任务。队列满时在此等待，把背压传导给调用方。
    pub async fn send_task(&self, task: Task) {
        let sender = {
            let mut queues = self.queues.lock();
            match queues.get(&task.user_id) {
                Some(sender) => sender.clone(),
                None => {
                    let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
                    queues.insert(task.user_id.clone(), sender.clone());
                    tokio::spawn(worker_loop(
                        task.user_id.clone(),
                        self.config.clone(),
                        receiver,
                    ));
                    sender
                }
            }
        };
        // 锁已释放，发送可以安全地阻塞

        if sender.send(task).await.is_err() {
            error!("worker queue closed unexpectedly");
        }
    }
}

async fn worker_loop(user_id: String, config: ChatGptConfig, mut queue: mpsc::Receiver<Task>) {
    let mut client = match ChatGptClient::new(config) {
        Ok(client) => client,
        Err(e) => {
            error!(user_id = %user_id, "failed to create chat client: {}", e);
            while let Some(task) = queue.recv().await {
                (task.handler)(Err(ChatError::Precondition(
                    "chat client unavailable".to_string(),
                )));
            }
            return;
        }
    };
    let mut conversation = client.new_conversation("");

    while let Some(task) = queue.recv().await {
        debug!(user_id = %user_id, content = %task.content, "handle task");

        let Task {
            content,
            timeout,
            handler,
            ..
        } = task;

        // 重置命令在worker内处理，不会发往上游
        if content == CMD_RESET {
            conversation = client.new_conversation("");
            handler(Ok(RESET_REPLY.to_string()));
            continue;
        }

        let processed = AssertUnwindSafe(async {
            match tokio::time::timeout(timeout, client.send_message(&mut conversation, &content))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ChatError::Timeout(timeout)),
            }
        })
        .catch_unwind()
        .await;

        // panic只中断当前任务，worker继续服务后续任务
        match processed {
            Ok(result) => {
                if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| handler(result))) {
                    warn!(user_id = %user_id, "panic in task handler: {}", panic_message(&panic));
                }
            }
            Err(panic) => {
                warn!(user_id = %user_id, "panic while processing task: {}", panic_message(&panic));
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
