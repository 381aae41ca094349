use super::{
    AnyMessage, MessageSink, MessageType, ParticipantId, Qos, SinkId, Transport, WriterId,
};
use ahash::{AHashMap, AHashSet};
use anyhow::{anyhow, bail};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

type TopicKey = (u16, String);

struct TopicEntry {
    message_type: MessageType,
    sinks: Vec<(u64, Arc<dyn MessageSink>)>,
    writers: Vec<u64>,
}

impl TopicEntry {
    fn is_unused(&self) -> bool {
        self.sinks.is_empty() && self.writers.is_empty()
    }

    fn matched_sinks(&self) -> Vec<Arc<dyn MessageSink>> {
        self.sinks.iter().map(|(_, s)| s.clone()).collect()
    }
}

struct Endpoint {
    participant: u64,
    topic: TopicKey,
}

#[derive(Default)]
struct State {
    participants: AHashMap<u64, u16>,
    topics: AHashMap<TopicKey, TopicEntry>,
    sinks: AHashMap<u64, Endpoint>,
    writers: AHashMap<u64, Endpoint>,
    rejected: AHashSet<String>,
}

impl State {
    fn domain_of(&self, participant: ParticipantId) -> anyhow::Result<u16> {
        self.participants
            .get(&participant.0)
            .copied()
            .ok_or_else(|| anyhow!("unknown {participant}"))
    }

    fn check_topic(&self, topic: &str) -> anyhow::Result<()> {
        if self.rejected.contains(topic) {
            bail!("topic '{topic}' rejected");
        }
        Ok(())
    }

    fn topic_entry(
        &mut self,
        key: TopicKey,
        message_type: &MessageType,
    ) -> anyhow::Result<&mut TopicEntry> {
        let entry = self.topics.entry(key).or_insert_with(|| TopicEntry {
            message_type: message_type.clone(),
            sinks: Vec::new(),
            writers: Vec::new(),
        });
        if entry.message_type != *message_type {
            bail!(
                "topic already carries '{}', not '{}'",
                entry.message_type.name(),
                message_type.name()
            );
        }
        Ok(entry)
    }

    fn release_topic_if_unused(&mut self, key: &TopicKey) {
        if self.topics.get(key).is_some_and(TopicEntry::is_unused) {
            self.topics.remove(key);
            tracing::debug!("[Loopback] topic '{}' released (domain {})", key.1, key.0);
        }
    }
}

/// In-process transport: every writer on a topic delivers to every sink
/// registered on the same `(domain, topic)` pair.
///
/// Delivery is synchronous on the writer's thread with the internal lock
/// released, which is enough to exercise the runtime end to end without a
/// network stack. Topics exist while at least one endpoint uses them.
pub struct LoopbackTransport {
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Make every future endpoint creation on `topic` fail.
    pub fn reject_topic(&self, topic: impl Into<String>) {
        self.state.lock().rejected.insert(topic.into());
    }

    /// Deliver `message` to every sink on `(domain, topic)` as if a remote
    /// writer had sent it. Returns the number of sinks reached.
    pub fn deliver(&self, domain_id: u16, topic: &str, message: AnyMessage) -> usize {
        let sinks = {
            let state = self.state.lock();
            match state.topics.get(&(domain_id, topic.to_string())) {
                Some(entry) => entry.matched_sinks(),
                None => return 0,
            }
        };
        for sink in &sinks {
            sink.on_message(message.clone());
        }
        sinks.len()
    }

    pub fn participant_count(&self) -> usize {
        self.state.lock().participants.len()
    }

    pub fn topic_count(&self) -> usize {
        self.state.lock().topics.len()
    }

    pub fn sink_count(&self) -> usize {
        self.state.lock().sinks.len()
    }

    pub fn writer_count(&self) -> usize {
        self.state.lock().writers.len()
    }

    fn notify(sinks: Vec<Arc<dyn MessageSink>>, count: i32) {
        for sink in sinks {
            sink.on_matched(count);
        }
    }
}

impl Transport for LoopbackTransport {
    fn create_participant(&self, domain_id: u16) -> anyhow::Result<ParticipantId> {
        let id = self.next_id();
        self.state.lock().participants.insert(id, domain_id);
        tracing::debug!("[Loopback] participant {} created on domain {}", id, domain_id);
        Ok(ParticipantId(id))
    }

    fn delete_participant(&self, participant: ParticipantId) {
        let (sinks, writers) = {
            let mut state = self.state.lock();
            if state.participants.remove(&participant.0).is_none() {
                return;
            }
            let owned = |m: &AHashMap<u64, Endpoint>| -> Vec<u64> {
                m.iter()
                    .filter(|(_, e)| e.participant == participant.0)
                    .map(|(id, _)| *id)
                    .collect()
            };
            (owned(&state.sinks), owned(&state.writers))
        };
        for id in writers {
            self.delete_writer(WriterId(id));
        }
        for id in sinks {
            self.unregister_sink(SinkId(id));
        }
    }

    fn register_sink(
        &self,
        participant: ParticipantId,
        topic: &str,
        message_type: &MessageType,
        _qos: &Qos,
        sink: Arc<dyn MessageSink>,
    ) -> anyhow::Result<SinkId> {
        let id = self.next_id();
        let matched = {
            let mut state = self.state.lock();
            let domain = state.domain_of(participant)?;
            state.check_topic(topic)?;
            let key = (domain, topic.to_string());
            let entry = state.topic_entry(key.clone(), message_type)?;
            entry.sinks.push((id, sink.clone()));
            let matched = entry.writers.len() as i32;
            state.sinks.insert(
                id,
                Endpoint {
                    participant: participant.0,
                    topic: key,
                },
            );
            matched
        };
        if matched > 0 {
            sink.on_matched(matched);
        }
        Ok(SinkId(id))
    }

    fn unregister_sink(&self, sink: SinkId) {
        let mut state = self.state.lock();
        let Some(endpoint) = state.sinks.remove(&sink.0) else {
            return;
        };
        if let Some(entry) = state.topics.get_mut(&endpoint.topic) {
            entry.sinks.retain(|(id, _)| *id != sink.0);
        }
        state.release_topic_if_unused(&endpoint.topic);
    }

    fn create_writer(
        &self,
        participant: ParticipantId,
        topic: &str,
        message_type: &MessageType,
        _qos: &Qos,
    ) -> anyhow::Result<WriterId> {
        let id = self.next_id();
        let (sinks, matched) = {
            let mut state = self.state.lock();
            let domain = state.domain_of(participant)?;
            state.check_topic(topic)?;
            let key = (domain, topic.to_string());
            let entry = state.topic_entry(key.clone(), message_type)?;
            entry.writers.push(id);
            let notify = (entry.matched_sinks(), entry.writers.len() as i32);
            state.writers.insert(
                id,
                Endpoint {
                    participant: participant.0,
                    topic: key,
                },
            );
            notify
        };
        Self::notify(sinks, matched);
        Ok(WriterId(id))
    }

    fn delete_writer(&self, writer: WriterId) {
        let (sinks, matched) = {
            let mut state = self.state.lock();
            let Some(endpoint) = state.writers.remove(&writer.0) else {
                return;
            };
            let notify = match state.topics.get_mut(&endpoint.topic) {
                Some(entry) => {
                    entry.writers.retain(|id| *id != writer.0);
                    (entry.matched_sinks(), entry.writers.len() as i32)
                }
                None => (Vec::new(), 0),
            };
            state.release_topic_if_unused(&endpoint.topic);
            notify
        };
        Self::notify(sinks, matched);
    }

    fn write(&self, writer: WriterId, message: AnyMessage) -> anyhow::Result<()> {
        let sinks = {
            let state = self.state.lock();
            let endpoint = state
                .writers
                .get(&writer.0)
                .ok_or_else(|| anyhow!("unknown {writer}"))?;
            match state.topics.get(&endpoint.topic) {
                Some(entry) => entry.matched_sinks(),
                None => Vec::new(),
            }
        };
        for sink in sinks {
            sink.on_message(message.clone());
        }
        Ok(())
    }

    fn subscriber_count(&self, writer: WriterId) -> i32 {
        let state = self.state.lock();
        state
            .writers
            .get(&writer.0)
            .and_then(|e| state.topics.get(&e.topic))
            .map_or(0, |entry| entry.sinks.len() as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[derive(Clone, Debug, PartialEq)]
    struct Ping(u32);

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<u32>>,
        matched: AtomicI32,
    }

    impl MessageSink for Recorder {
        fn on_message(&self, message: AnyMessage) {
            if let Some(ping) = message.downcast_ref::<Ping>() {
                self.received.lock().push(ping.0);
            }
        }

        fn on_matched(&self, current_count: i32) {
            self.matched.store(current_count, Ordering::SeqCst);
        }
    }

    fn ping_type() -> MessageType {
        MessageType::of::<Ping>("Ping")
    }

    #[test]
    fn writer_reaches_sinks_on_same_domain_only() {
        let t = LoopbackTransport::new();
        let p0 = t.create_participant(0).unwrap();
        let p1 = t.create_participant(1).unwrap();
        let near = Arc::new(Recorder::default());
        let far = Arc::new(Recorder::default());
        let qos = Qos::default();

        t.register_sink(p0, "rt/ping", &ping_type(), &qos, near.clone()).unwrap();
        t.register_sink(p1, "rt/ping", &ping_type(), &qos, far.clone()).unwrap();
        let w = t.create_writer(p0, "rt/ping", &ping_type(), &qos).unwrap();

        assert_eq!(near.matched.load(Ordering::SeqCst), 1);
        assert_eq!(t.subscriber_count(w), 1);

        t.write(w, Arc::new(Ping(7))).unwrap();
        assert_eq!(*near.received.lock(), vec![7]);
        assert!(far.received.lock().is_empty());
    }

    #[test]
    fn topic_type_is_fixed_by_first_endpoint() {
        #[derive(Clone)]
        struct Other;

        let t = LoopbackTransport::new();
        let p = t.create_participant(0).unwrap();
        t.create_writer(p, "rt/a", &ping_type(), &Qos::default()).unwrap();
        let err = t.create_writer(p, "rt/a", &MessageType::of::<Other>("Other"), &Qos::default());
        assert!(err.is_err());
    }

    #[test]
    fn topics_are_released_with_their_last_endpoint() {
        let t = LoopbackTransport::new();
        let p = t.create_participant(0).unwrap();
        let sink = Arc::new(Recorder::default());
        let s = t
            .register_sink(p, "rt/x", &ping_type(), &Qos::default(), sink.clone())
            .unwrap();
        let w = t.create_writer(p, "rt/x", &ping_type(), &Qos::default()).unwrap();
        assert_eq!(t.topic_count(), 1);

        t.delete_writer(w);
        assert_eq!(sink.matched.load(Ordering::SeqCst), 0);
        assert_eq!(t.topic_count(), 1);
        t.unregister_sink(s);
        assert_eq!(t.topic_count(), 0);
    }

    #[test]
    fn deleting_participant_removes_its_endpoints() {
        let t = LoopbackTransport::new();
        let p = t.create_participant(3).unwrap();
        t.register_sink(p, "rt/x", &ping_type(), &Qos::default(), Arc::new(Recorder::default()))
            .unwrap();
        t.create_writer(p, "rt/y", &ping_type(), &Qos::default()).unwrap();

        t.delete_participant(p);
        assert_eq!(t.participant_count(), 0);
        assert_eq!(t.sink_count(), 0);
        assert_eq!(t.writer_count(), 0);
        assert_eq!(t.topic_count(), 0);
    }

    #[test]
    fn rejected_topics_and_unknown_participants_fail() {
        let t = LoopbackTransport::new();
        let p = t.create_participant(0).unwrap();
        t.reject_topic("rt/bad");
        assert!(t.create_writer(p, "rt/bad", &ping_type(), &Qos::default()).is_err());
        assert!(
            t.register_sink(
                ParticipantId(999),
                "rt/ok",
                &ping_type(),
                &Qos::default(),
                Arc::new(Recorder::default())
            )
            .is_err()
        );
    }

    #[test]
    fn deliver_injects_without_writer() {
        let t = LoopbackTransport::new();
        let p = t.create_participant(0).unwrap();
        let sink = Arc::new(Recorder::default());
        t.register_sink(p, "rt/in", &ping_type(), &Qos::default(), sink.clone())
            .unwrap();

        assert_eq!(t.deliver(0, "rt/in", Arc::new(Ping(1))), 1);
        assert_eq!(t.deliver(0, "rt/none", Arc::new(Ping(2))), 0);
        assert_eq!(*sink.received.lock(), vec![1]);
    }
}
