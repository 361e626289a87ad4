use crate::plugins::PluginError;
use crate::{debug, error, warn};
use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

/// 队列中的任务只需提供一个展示用的标签
pub trait QueuedJob: Send + 'static {
    fn label(&self) -> &str;
}

pub type JobRunner<J> = Arc<dyn Fn(J) -> BoxFuture<'static, Result<(), PluginError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// `total` = 排队数 + 执行数 (含本任务)
    Accepted { total: usize, running: usize },
    Rejected,
}

struct QueueState<J> {
    pending: VecDeque<J>,
    running: usize,
    max_concurrent: usize,
}

/// 有界 FIFO 队列 + 并发上限。锁只在同步代码中持有。
pub struct JobQueue<J> {
    state: Arc<Mutex<QueueState<J>>>,
    runner: JobRunner<J>,
}

impl<J> Clone for JobQueue<J> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            runner: self.runner.clone(),
        }
    }
}

impl<J: QueuedJob> JobQueue<J> {
    pub fn new(runner: JobRunner<J>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                pending: VecDeque::new(),
                running: 0,
                max_concurrent: 1,
            })),
            runner,
        }
    }

    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PluginError>> + Send + 'static,
    {
        Self::new(Arc::new(
            move |job| -> BoxFuture<'static, Result<(), PluginError>> { Box::pin(f(job)) },
        ))
    }

    pub fn enqueue(&self, job: J, max_queue: usize, max_concurrent: usize) -> Admission {
        let admission = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.pending.len() >= max_queue {
                return Admission::Rejected;
            }
            debug!(target: "Banana", "任务入队: {}", job.label());
            state.pending.push_back(job);
            state.max_concurrent = max_concurrent;
            Admission::Accepted {
                total: state.pending.len() + state.running,
                running: state.running,
            }
        };
        self.admit();
        admission
    }

    /// 在并发上限内依次取出队首任务执行
    fn admit(&self) {
        loop {
            let job = {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.running >= state.max_concurrent {
                    return;
                }
                let Some(job) = state.pending.pop_front() else {
                    return;
                };
                state.running += 1;
                job
            };

            let label = job.label().to_string();
            let work = (self.runner)(job);
            let queue = self.clone();
            tokio::spawn(async move {
                match tokio::spawn(work).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(target: "Banana", "任务 [{}] 执行出错: {}", label, e),
                    Err(e) => error!(target: "Banana", "任务 [{}] 异常退出: {}", label, e),
                }
                queue.complete();
            });
        }
    }

    fn complete(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.running = state.running.saturating_sub(1);
        }
        self.admit();
    }

    pub fn pending_len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct TestJob(String);

    impl QueuedJob for TestJob {
        fn label(&self) -> &str {
            &self.0
        }
    }

    impl<J: QueuedJob> JobQueue<J> {
        fn running(&self) -> usize {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .running
        }

        fn pending_labels(&self) -> Vec<String> {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pending
                .iter()
                .map(|j| j.label().to_string())
                .collect()
        }
    }

    fn job(n: usize) -> TestJob {
        TestJob(format!("job{}", n))
    }

    #[tokio::test]
    async fn sixth_enqueue_is_rejected() {
        // 并发为 0 时任务全部停在队列里
        let queue = JobQueue::from_fn(|_: TestJob| async { Ok::<(), PluginError>(()) });
        for i in 0..5 {
            assert!(matches!(
                queue.enqueue(job(i), 5, 0),
                Admission::Accepted { .. }
            ));
        }
        assert_eq!(queue.enqueue(job(5), 5, 0), Admission::Rejected);
        assert_eq!(queue.pending_len(), 5);
        assert!(!queue.pending_labels().contains(&"job5".to_string()));
    }

    #[tokio::test]
    async fn running_job_does_not_count_against_queue_bound() {
        let gate = Arc::new(Semaphore::new(0));
        let g = gate.clone();
        let queue = JobQueue::from_fn(move |_: TestJob| {
            let g = g.clone();
            async move {
                let _permit = g.acquire().await;
                Ok::<(), PluginError>(())
            }
        });

        assert_eq!(
            queue.enqueue(job(0), 2, 1),
            Admission::Accepted {
                total: 1,
                running: 0
            }
        );
        assert_eq!(queue.running(), 1);
        assert_eq!(
            queue.enqueue(job(1), 2, 1),
            Admission::Accepted {
                total: 2,
                running: 1
            }
        );
        assert!(matches!(queue.enqueue(job(2), 2, 1), Admission::Accepted { .. }));
        assert_eq!(queue.enqueue(job(3), 2, 1), Admission::Rejected);

        gate.add_permits(3);
        for _ in 0..50 {
            if queue.running() == 0 && queue.pending_len() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queue.running(), 0);
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_ceiling_holds() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let (a, p, d) = (active.clone(), peak.clone(), done.clone());

        let queue = JobQueue::from_fn(move |_: TestJob| {
            let (a, p, d) = (a.clone(), p.clone(), d.clone());
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                a.fetch_sub(1, Ordering::SeqCst);
                d.fetch_add(1, Ordering::SeqCst);
                Ok::<(), PluginError>(())
            }
        });

        for i in 0..8 {
            queue.enqueue(job(i), 10, 2);
        }
        for _ in 0..200 {
            if done.load(Ordering::SeqCst) == 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn jobs_start_in_fifo_order_and_errors_free_the_slot() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        let queue = JobQueue::from_fn(move |j: TestJob| {
            let o = o.clone();
            async move {
                o.lock().unwrap().push(j.0.clone());
                if j.0 == "job1" {
                    return Err::<(), PluginError>("boom".into());
                }
                Ok(())
            }
        });

        for i in 0..4 {
            queue.enqueue(job(i), 10, 1);
        }
        for _ in 0..100 {
            if order.lock().unwrap().len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            *order.lock().unwrap(),
            vec!["job0", "job1", "job2", "job3"]
        );
    }
}
