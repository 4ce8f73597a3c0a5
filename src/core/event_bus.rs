//! Pub/Sub event bus for layer and timeline notifications.
//!
//! - Observers subscribe per event type with callbacks (immediate invocation)
//! - emit() invokes callbacks on the emitting thread AND queues the event
//! - poll() drains queued events for consumers that prefer batch processing
//!
//! Callbacks for one event type run in subscription order. Compose workers emit
//! from their own thread, so callbacks must be `Send + Sync`.
//!
//! Nothing in the layer/compose subsystem depends on a listener being present:
//! files on disk are correct whether or not anyone subscribes.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use log::warn;

/// Maximum events in queue before oldest are evicted
const MAX_QUEUE_SIZE: usize = 1000;

/// Marker trait for events. Events must be Send + Sync + 'static.
pub trait Event: Any + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
}

impl<T: Any + Send + Sync + 'static> Event for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

type Callback = Arc<dyn Fn(&dyn Any) + Send + Sync>;

/// Boxed event for queue storage
pub type BoxedEvent = Box<dyn Event>;

/// Subscriber table and deferred queue, shared by the bus and its emitters.
#[derive(Clone, Default)]
struct Channels {
    subscribers: Arc<RwLock<HashMap<TypeId, Vec<Callback>>>>,
    queue: Arc<Mutex<Vec<BoxedEvent>>>,
}

impl Channels {
    fn dispatch(&self, type_id: TypeId, event: &dyn Any) {
        // Clone the callback list so a callback may subscribe without deadlocking.
        let callbacks: Vec<Callback> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&type_id)
            .cloned()
            .unwrap_or_default();
        for cb in callbacks {
            cb(event);
        }
    }

    fn enqueue(&self, event: BoxedEvent) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= MAX_QUEUE_SIZE {
            let evict_count = queue.len() / 2;
            warn!(
                "Event queue full ({} events), evicting oldest {}",
                queue.len(),
                evict_count
            );
            queue.drain(0..evict_count);
        }
        queue.push(event);
    }

    fn emit<E: Event + Clone>(&self, event: E) {
        self.dispatch(TypeId::of::<E>(), &event);
        self.enqueue(Box::new(event));
    }
}

/// Pub/Sub event bus with deferred processing support.
///
/// Callbacks fire immediately on emit, and every event is also queued for
/// retrieval via poll(). A bus is cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct EventBus {
    channels: Channels,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("queue_len", &self.queue_len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events of type E.
    ///
    /// # Example
    /// ```ignore
    /// bus.subscribe::<TimelineChangedEvent, _>(move |e| {
    ///     log::info!("item {} refreshed", e.item_index);
    /// });
    /// ```
    pub fn subscribe<E, F>(&self, callback: F)
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let wrapped: Callback = Arc::new(move |any: &dyn Any| {
            if let Some(event) = any.downcast_ref::<E>() {
                callback(event);
            }
        });
        self.channels
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(TypeId::of::<E>())
            .or_default()
            .push(wrapped);
    }

    /// Emit event: invoke callbacks immediately AND queue for poll().
    pub fn emit<E: Event + Clone>(&self, event: E) {
        self.channels.emit(event);
    }

    /// Drain all queued events.
    pub fn poll(&self) -> Vec<BoxedEvent> {
        std::mem::take(&mut *self.channels.queue.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Get an emitter handle for passing to producers (layer managers, workers).
    pub fn emitter(&self) -> EventEmitter {
        EventEmitter {
            channels: self.channels.clone(),
        }
    }

    /// Clear subscribers for type E
    pub fn unsubscribe_all<E: Event>(&self) {
        self.channels
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&TypeId::of::<E>());
    }

    /// Check if there are subscribers for event type E
    pub fn has_subscribers<E: Event>(&self) -> bool {
        self.channels
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<E>())
            .is_some_and(|v| !v.is_empty())
    }

    pub fn queue_len(&self) -> usize {
        self.channels.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Lightweight emitter handle. Producers never see the subscriber side.
#[derive(Clone)]
pub struct EventEmitter {
    channels: Channels,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field(
                "subscriber_types",
                &self.channels.subscribers.read().map(|s| s.len()).unwrap_or(0),
            )
            .finish()
    }
}

impl EventEmitter {
    pub fn emit<E: Event + Clone>(&self, event: E) {
        self.channels.emit(event);
    }
}

/// Optional emitter: a no-op until wired to a bus.
///
/// Layer managers and compose tasks hold one of these so they can be built in
/// isolation (tests, CLI one-shots) without an event bus.
#[derive(Clone, Default, Debug)]
pub struct Notifier {
    inner: Option<EventEmitter>,
}

impl Notifier {
    /// No-op notifier
    pub fn dummy() -> Self {
        Self { inner: None }
    }

    pub fn from_emitter(emitter: EventEmitter) -> Self {
        Self {
            inner: Some(emitter),
        }
    }

    /// Emit event (no-op if dummy)
    pub fn emit<E: Event + Clone>(&self, event: E) {
        if let Some(ref emitter) = self.inner {
            emitter.emit(event);
        }
    }
}

/// Downcast a queued event to a concrete type.
///
/// Must deref to `dyn Event` before `as_any()`: the blanket impl would
/// otherwise match `Box<dyn Event>` itself and the downcast always fails.
#[inline]
pub fn downcast_event<E: Event>(event: &BoxedEvent) -> Option<&E> {
    (**event).as_any().downcast_ref::<E>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{LayerChangeKind, TimelineChangedEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn changed(index: usize) -> TimelineChangedEvent {
        TimelineChangedEvent {
            item_index: index,
            image_path: "image.png".into(),
            video_path: "video.mp4".into(),
        }
    }

    #[test]
    fn test_subscribe_emit_immediate() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);

        bus.subscribe::<TimelineChangedEvent, _>(move |e| {
            s.fetch_add(e.item_index, Ordering::SeqCst);
        });

        bus.emit(changed(3));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        bus.emit(changed(4));
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_emit_queues_for_poll() {
        let bus = EventBus::new();
        bus.emit(changed(1));
        bus.emit(LayerChangeKind::Added);

        let events = bus.poll();
        assert_eq!(events.len(), 2);
        assert!(downcast_event::<TimelineChangedEvent>(&events[0]).is_some());
        assert_eq!(
            downcast_event::<LayerChangeKind>(&events[1]),
            Some(&LayerChangeKind::Added)
        );
        assert_eq!(bus.poll().len(), 0);
    }

    #[test]
    fn test_emitter_shares_subscribers() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        bus.subscribe::<TimelineChangedEvent, _>(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        let notifier = Notifier::from_emitter(bus.emitter());
        notifier.emit(changed(2));
        Notifier::dummy().emit(changed(2));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.queue_len(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        bus.subscribe::<TimelineChangedEvent, _>(|_| {});
        assert!(bus.has_subscribers::<TimelineChangedEvent>());
        bus.unsubscribe_all::<TimelineChangedEvent>();
        assert!(!bus.has_subscribers::<TimelineChangedEvent>());
        bus.emit(changed(1));
        assert_eq!(bus.poll().len(), 1);
    }
}
