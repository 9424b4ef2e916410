//! Transaction correlation (spec.md §4.8), grounded in
//! `examples/original_source/src/pw_jobmanager.h`. A `Job` correlates an
//! outbound request with a response that may arrive on a different
//! channel, or with nothing at all (timeout). The original's
//! pointer-keyed, virtual-dispatch `Job`/`JobManager` pair becomes a
//! handler trait plus a plain `HashMap`, per spec.md §9's redesign notes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::channel::ChannelError;
use crate::registry::ChannelName;

/// Job correlation key. `0` is never minted by [`JobManager::next_key`].
pub type JobKey = u32;

/// Hooks a job implements to react to its eventual packet, error, or
/// timeout. `true` tells the manager to drop the job afterward, mirroring
/// the original's `del_this` out-parameter.
pub trait JobHandler<P>: Send {
    fn on_packet(&mut self, channel: ChannelName, pk: &P, param: Option<u64>) -> bool {
        let _ = (channel, pk, param);
        true
    }

    fn on_error(&mut self, channel: ChannelName, err: ChannelError, errno: i32) -> bool {
        let _ = (channel, err, errno);
        true
    }

    fn on_timeout(&mut self, age: Duration) -> bool {
        let _ = age;
        true
    }
}

struct JobRecord<P> {
    start: Instant,
    handler: Box<dyn JobHandler<P>>,
}

enum ReserveEvent<P> {
    Packet {
        key: JobKey,
        channel: ChannelName,
        pk: Arc<P>,
        param: Option<u64>,
    },
    Error {
        key: JobKey,
        channel: ChannelName,
        err: ChannelError,
        errno: i32,
    },
}

/// Owns every in-flight `Job` of packet type `P`. One `JobManager` exists
/// per protocol that needs request/response correlation (e.g. the Msg
/// protocol used by [`crate::pool::MultiChannelPool`]).
pub struct JobManager<P> {
    jobs: HashMap<JobKey, JobRecord<P>>,
    kills: HashSet<JobKey>,
    next_key: JobKey,
    reserve: Mutex<VecDeque<ReserveEvent<P>>>,
}

impl<P> JobManager<P> {
    pub fn new() -> Self {
        JobManager {
            jobs: HashMap::new(),
            kills: HashSet::new(),
            next_key: 1,
            reserve: Mutex::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Elapsed time since `key`'s job was created, or `None` if it has
    /// already completed, timed out, or never existed.
    pub fn job_age(&self, key: JobKey) -> Option<Duration> {
        self.jobs.get(&key).map(|record| Instant::now().saturating_duration_since(record.start))
    }

    /// Monotonic key allocator: `0` is never valid, and on collision with a
    /// still-live job the allocator advances linearly until a free slot is
    /// found (the original's `getKey` behavior under wraparound).
    fn next_key(&mut self) -> JobKey {
        loop {
            let candidate = self.next_key;
            self.next_key = self.next_key.wrapping_add(1);
            if self.next_key == 0 {
                self.next_key = 1;
            }
            if candidate != 0 && !self.jobs.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Registers a new job, returning its correlation key.
    pub fn add(&mut self, handler: Box<dyn JobHandler<P>>) -> JobKey {
        let key = self.next_key();
        self.jobs.insert(
            key,
            JobRecord {
                start: Instant::now(),
                handler,
            },
        );
        key
    }

    /// Marks `key` for removal on the next kill-set drain. Safe to call
    /// from within a dispatch callback (the job currently being dispatched
    /// is not removed out from under the caller).
    pub fn release(&mut self, key: JobKey) {
        self.kills.insert(key);
    }

    fn drain_kills(&mut self) {
        for key in self.kills.drain() {
            self.jobs.remove(&key);
        }
    }

    /// Synchronously dispatches a packet to `key`'s job. Returns `false` if
    /// no such job exists (already completed, timed out, or never valid).
    pub fn dispatch_packet(&mut self, key: JobKey, channel: ChannelName, pk: &P, param: Option<u64>) -> bool {
        let Some(record) = self.jobs.get_mut(&key) else {
            return false;
        };
        let del_this = record.handler.on_packet(channel, pk, param);
        if del_this {
            self.jobs.remove(&key);
        }
        true
    }

    /// Symmetric error path for `dispatch_packet`.
    pub fn dispatch_error(&mut self, key: JobKey, channel: ChannelName, err: ChannelError, errno: i32) -> bool {
        let Some(record) = self.jobs.get_mut(&key) else {
            return false;
        };
        let del_this = record.handler.on_error(channel, err, errno);
        if del_this {
            self.jobs.remove(&key);
        }
        true
    }

    /// Enqueues a packet dispatch for later draining via
    /// [`JobManager::dispatch_reserve`], for callers that cannot safely
    /// reach into the job table synchronously (e.g. a handler running on a
    /// worker thread). `pk` is shared so the same received packet can also
    /// be delivered to its originating channel.
    pub fn reserve_packet(&self, key: JobKey, channel: ChannelName, pk: Arc<P>, param: Option<u64>) {
        self.reserve.lock().unwrap().push_back(ReserveEvent::Packet { key, channel, pk, param });
    }

    pub fn reserve_error(&self, key: JobKey, channel: ChannelName, err: ChannelError, errno: i32) {
        self.reserve.lock().unwrap().push_back(ReserveEvent::Error { key, channel, err, errno });
    }

    /// Drains the reserve queue, synchronously dispatching each event in
    /// FIFO order. Returns the number of events processed.
    pub fn dispatch_reserve(&mut self) -> usize {
        let drained: Vec<_> = self.reserve.lock().unwrap().drain(..).collect();
        let n = drained.len();
        for event in drained {
            match event {
                ReserveEvent::Packet { key, channel, pk, param } => {
                    self.dispatch_packet(key, channel, &pk, param);
                }
                ReserveEvent::Error { key, channel, err, errno } => {
                    self.dispatch_error(key, channel, err, errno);
                }
            }
        }
        n
    }

    /// Fires the timeout hook on every job older than `limit`. Drains the
    /// kill set before and after the sweep, per spec.md §4.8. Returns the
    /// number of jobs that fired.
    pub fn check_timeout(&mut self, limit: Duration) -> usize {
        self.drain_kills();

        let now = Instant::now();
        let expired: Vec<JobKey> = self
            .jobs
            .iter()
            .filter(|(_, record)| now.saturating_duration_since(record.start) >= limit)
            .map(|(&key, _)| key)
            .collect();

        let mut fired = 0;
        for key in &expired {
            if let Some(record) = self.jobs.get_mut(key) {
                let age = now.saturating_duration_since(record.start);
                let del_this = record.handler.on_timeout(age);
                fired += 1;
                if del_this {
                    self.jobs.remove(key);
                }
            }
        }

        self.drain_kills();
        fired
    }

    /// Convenience for a reactor main loop: kill-set, then reserve queue,
    /// then timeout sweep, matching spec.md §4.8's ordering.
    pub fn tick(&mut self, timeout: Duration) -> usize {
        self.drain_kills();
        self.dispatch_reserve();
        self.drain_kills();
        self.check_timeout(timeout)
    }
}

impl<P> Default for JobManager<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ChannelRegistry;

    fn test_channel_name() -> ChannelName {
        let mut reg: ChannelRegistry<()> = ChannelRegistry::new();
        reg.insert(())
    }

    struct RecordingHandler {
        packets: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
        timed_out: std::sync::Arc<std::sync::Mutex<bool>>,
        keep_alive: bool,
    }

    impl JobHandler<String> for RecordingHandler {
        fn on_packet(&mut self, _channel: ChannelName, pk: &String, _param: Option<u64>) -> bool {
            self.packets.lock().unwrap().push(pk.clone());
            !self.keep_alive
        }

        fn on_timeout(&mut self, _age: Duration) -> bool {
            *self.timed_out.lock().unwrap() = true;
            true
        }
    }

    #[test]
    fn dispatch_packet_removes_job_when_handler_requests_deletion() {
        let mut man: JobManager<String> = JobManager::new();
        let packets = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let timed_out = std::sync::Arc::new(std::sync::Mutex::new(false));
        let key = man.add(Box::new(RecordingHandler {
            packets: packets.clone(),
            timed_out,
            keep_alive: false,
        }));

        let name = test_channel_name();
        assert!(man.dispatch_packet(key, name, &"hello".to_string(), None));
        assert_eq!(*packets.lock().unwrap(), vec!["hello".to_string()]);
        assert_eq!(man.len(), 0);

        // Second dispatch against the now-gone key reports "not found".
        assert!(!man.dispatch_packet(key, name, &"again".to_string(), None));
    }

    #[test]
    fn dispatch_packet_keeps_job_alive_when_handler_says_so() {
        let mut man: JobManager<String> = JobManager::new();
        let packets = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let timed_out = std::sync::Arc::new(std::sync::Mutex::new(false));
        let key = man.add(Box::new(RecordingHandler {
            packets: packets.clone(),
            timed_out,
            keep_alive: true,
        }));

        let name = test_channel_name();
        man.dispatch_packet(key, name, &"one".to_string(), None);
        man.dispatch_packet(key, name, &"two".to_string(), None);
        assert_eq!(*packets.lock().unwrap(), vec!["one".to_string(), "two".to_string()]);
        assert_eq!(man.len(), 1);
    }

    #[test]
    fn check_timeout_fires_after_limit_elapses() {
        let mut man: JobManager<String> = JobManager::new();
        let packets = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let timed_out = std::sync::Arc::new(std::sync::Mutex::new(false));
        man.add(Box::new(RecordingHandler {
            packets,
            timed_out: timed_out.clone(),
            keep_alive: false,
        }));

        assert_eq!(man.check_timeout(Duration::from_millis(500)), 0);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(man.check_timeout(Duration::from_millis(20)), 1);
        assert!(*timed_out.lock().unwrap());
        assert!(man.is_empty());
    }

    #[test]
    fn release_defers_removal_to_the_kill_set() {
        let mut man: JobManager<String> = JobManager::new();
        let packets = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let timed_out = std::sync::Arc::new(std::sync::Mutex::new(false));
        let key = man.add(Box::new(RecordingHandler {
            packets,
            timed_out,
            keep_alive: true,
        }));

        man.release(key);
        assert_eq!(man.len(), 1, "kill set not drained yet");
        man.tick(Duration::from_secs(60));
        assert_eq!(man.len(), 0);
    }

    #[test]
    fn job_age_reflects_elapsed_time_and_vanishes_after_completion() {
        let mut man: JobManager<String> = JobManager::new();
        let packets = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let timed_out = std::sync::Arc::new(std::sync::Mutex::new(false));
        let key = man.add(Box::new(RecordingHandler {
            packets: packets.clone(),
            timed_out,
            keep_alive: false,
        }));

        assert!(man.job_age(key).is_some());
        let name = test_channel_name();
        man.dispatch_packet(key, name, &"done".to_string(), None);
        assert_eq!(man.job_age(key), None);
    }

    #[test]
    fn reserve_queue_drains_in_fifo_order() {
        let mut man: JobManager<String> = JobManager::new();
        let packets = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let timed_out = std::sync::Arc::new(std::sync::Mutex::new(false));
        let key = man.add(Box::new(RecordingHandler {
            packets: packets.clone(),
            timed_out,
            keep_alive: true,
        }));

        let name = test_channel_name();
        man.reserve_packet(key, name, Arc::new("a".to_string()), None);
        man.reserve_packet(key, name, Arc::new("b".to_string()), None);
        assert_eq!(man.dispatch_reserve(), 2);
        assert_eq!(*packets.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
