use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use redis::{AsyncCommands, Script, aio::ConnectionManager};
use tracing::{debug, info, warn};

use super::types::{
    Broker, BrokerResult, EnqueueOptions, FailOutcome, TaskInfo, TaskMessage, prepare,
    retry_or_bury,
};

/// Pops the first available message across KEYS and records it in the
/// active hash (ARGV[1]) in one step.
const POP_SCRIPT: &str = r#"
for _, key in ipairs(KEYS) do
    local msg = redis.call('RPOP', key)
    if msg then
        local task = cjson.decode(msg)
        redis.call('HSET', ARGV[1], task['id'], msg)
        return msg
    end
end
return false
"#;

/// Redis-list backed broker.
///
/// Layout under `prefix`: `{prefix}:queue:{name}` lists (LPUSH in, RPOP
/// out), `{prefix}:active` hash of in-flight tasks by id, `{prefix}:dead`
/// list of tasks that ran out of retries.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    prefix: String,
    pop: Script,
    poll_interval: Duration,
}

impl RedisBroker {
    pub async fn connect(url: &str, prefix: &str) -> BrokerResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        info!("connected to redis broker at {}", url);

        Ok(RedisBroker {
            conn,
            prefix: prefix.to_string(),
            pop: Script::new(POP_SCRIPT),
            poll_interval: Duration::from_millis(200),
        })
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.prefix, queue)
    }

    fn active_key(&self) -> String {
        format!("{}:active", self.prefix)
    }

    fn dead_key(&self) -> String {
        format!("{}:dead", self.prefix)
    }

    /// Puts tasks left active by a previous process back on their queues.
    /// Only safe while this is the sole consumer of the prefix.
    pub async fn recover(&self) -> BrokerResult<usize> {
        let mut conn = self.conn.clone();
        let active: HashMap<String, String> = conn.hgetall(self.active_key()).await?;

        for (id, raw) in &active {
            let task: TaskMessage = serde_json::from_str(raw)?;
            let _: () = redis::pipe()
                .atomic()
                .hdel(self.active_key(), id)
                .lpush(self.queue_key(&task.queue), raw)
                .query_async(&mut conn)
                .await?;
            warn!("re-queued task {} ({}) left active by a previous run", id, task.kind);
        }
        Ok(active.len())
    }

    async fn try_pop(&self, queues: &[String]) -> BrokerResult<Option<TaskMessage>> {
        let mut conn = self.conn.clone();
        let mut invocation = self.pop.prepare_invoke();
        for queue in queues {
            invocation.key(self.queue_key(queue));
        }
        invocation.arg(self.active_key());

        let popped: Option<String> = invocation.invoke_async(&mut conn).await?;
        match popped {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, task: TaskMessage, options: &EnqueueOptions) -> BrokerResult<TaskInfo> {
        let (task, info) = prepare(task, options);
        let raw = serde_json::to_string(&task)?;

        let mut conn = self.conn.clone();
        let _: () = conn.lpush(self.queue_key(&task.queue), raw).await?;
        debug!("enqueue {} ({}) on {}", info.id, info.kind, info.queue);
        Ok(info)
    }

    async fn dequeue(&self, queues: &[String], wait: Duration) -> BrokerResult<Option<TaskMessage>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(task) = self.try_pop(queues).await? {
                return Ok(Some(task));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn complete(&self, task: &TaskMessage) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(self.active_key(), task.id.to_string()).await?;
        Ok(())
    }

    async fn fail(&self, task: TaskMessage, error: String) -> BrokerResult<FailOutcome> {
        let id = task.id.to_string();
        let (task, outcome) = retry_or_bury(task, error);
        let raw = serde_json::to_string(&task)?;
        let target = match outcome {
            FailOutcome::Retried => self.queue_key(&task.queue),
            FailOutcome::Dead => self.dead_key(),
        };

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hdel(self.active_key(), id)
            .ignore()
            .lpush(target, raw)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    #[ignore = "needs a redis server at REDIS_URL"]
    async fn live_round_trip_with_retry() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let prefix = format!("sandboxd-test-{}", uuid::Uuid::new_v4());
        let broker = RedisBroker::connect(&url, &prefix).await.unwrap();
        let queues = vec!["default".to_string()];

        let task = TaskMessage::new("container:create", &json!({"UserID": 1})).unwrap();
        broker.enqueue(task, &EnqueueOptions::default()).await.unwrap();

        let got = broker.dequeue(&queues, Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(got.payload, json!({"UserID": 1}));
        assert_eq!(broker.fail(got, "boom".to_string()).await.unwrap(), FailOutcome::Retried);

        let again = broker.dequeue(&queues, Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(again.retried, 1);
        broker.complete(&again).await.unwrap();
        assert_eq!(broker.recover().await.unwrap(), 0);
    }
}
