use super::message::Message;
use crate::config::InboxOverflowPolicy;
use std::collections::VecDeque;

/// Outcome of offering a message to a bounded inbox.
#[derive(Debug)]
pub(crate) enum Admission {
    Accepted,
    /// Accepted after evicting an older message (drop-oldest policy).
    Evicted(Message),
    /// Rejected; the message is handed back to the caller.
    Full(Message),
}

/// Bounded priority queue backing one registered agent.
///
/// One FIFO deque per priority class, in admission order. Dequeue takes the
/// front of the highest non-empty class.
#[derive(Debug)]
pub(crate) struct PriorityInbox {
    classes: [VecDeque<Message>; 3],
    capacity: usize,
    high_water: usize,
}

impl PriorityInbox {
    /// `capacity == 0` means unbounded.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            classes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            capacity,
            high_water: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.classes.iter().map(VecDeque::len).sum()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.classes.iter().all(VecDeque::is_empty)
    }

    pub(crate) fn high_water(&self) -> usize {
        self.high_water
    }

    #[cfg(test)]
    pub(crate) fn depth_of(&self, priority: super::message::Priority) -> usize {
        self.classes[priority.rank()].len()
    }

    pub(crate) fn offer(&mut self, message: Message, policy: InboxOverflowPolicy) -> Admission {
        let mut evicted = None;
        if self.capacity > 0 && self.len() >= self.capacity {
            match policy {
                InboxOverflowPolicy::Reject => return Admission::Full(message),
                InboxOverflowPolicy::DropOldest => {
                    evicted = self.evict_oldest_lowest();
                }
            }
        }

        self.insert(message);
        match evicted {
            Some(message) => Admission::Evicted(message),
            None => Admission::Accepted,
        }
    }

    pub(crate) fn pop(&mut self) -> Option<Message> {
        self.classes.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Remove everything, returning how many messages were discarded.
    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.len();
        for class in &mut self.classes {
            class.clear();
        }
        dropped
    }

    fn insert(&mut self, message: Message) {
        self.classes[message.priority.rank()].push_back(message);
        self.high_water = self.high_water.max(self.len());
    }

    fn evict_oldest_lowest(&mut self) -> Option<Message> {
        self.classes.iter_mut().rev().find_map(VecDeque::pop_front)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Priority;
    use std::time::Duration;

    fn msg(content: &str, priority: Priority) -> Message {
        Message::new("sender", "inbox", "test", content).with_priority(priority)
    }

    fn text(message: Option<Message>) -> String {
        message
            .and_then(|m| m.content.as_text().map(str::to_string))
            .unwrap_or_default()
    }

    #[test]
    fn higher_priority_dequeues_first() {
        let mut inbox = PriorityInbox::new(0);
        inbox.offer(msg("low", Priority::Low), InboxOverflowPolicy::Reject);
        inbox.offer(msg("normal", Priority::Normal), InboxOverflowPolicy::Reject);
        inbox.offer(msg("high", Priority::High), InboxOverflowPolicy::Reject);

        assert_eq!(text(inbox.pop()), "high");
        assert_eq!(text(inbox.pop()), "normal");
        assert_eq!(text(inbox.pop()), "low");
        assert!(inbox.pop().is_none());
    }

    #[test]
    fn fifo_within_priority_class() {
        let mut inbox = PriorityInbox::new(0);
        for i in 0..5 {
            inbox.offer(msg(&format!("m{i}"), Priority::Normal), InboxOverflowPolicy::Reject);
        }
        let order: Vec<String> = (0..5).map(|_| text(inbox.pop())).collect();
        assert_eq!(order, ["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn admission_order_wins_over_construction_order() {
        let mut inbox = PriorityInbox::new(0);
        let built_first = msg("built-first", Priority::Normal);
        std::thread::sleep(Duration::from_millis(2));
        let built_second = msg("built-second", Priority::Normal);

        inbox.offer(built_second, InboxOverflowPolicy::Reject);
        inbox.offer(built_first, InboxOverflowPolicy::Reject);

        assert_eq!(text(inbox.pop()), "built-second");
        assert_eq!(text(inbox.pop()), "built-first");
    }

    #[test]
    fn reject_policy_returns_message_when_full() {
        let mut inbox = PriorityInbox::new(2);
        assert!(matches!(
            inbox.offer(msg("a", Priority::Normal), InboxOverflowPolicy::Reject),
            Admission::Accepted
        ));
        assert!(matches!(
            inbox.offer(msg("b", Priority::Normal), InboxOverflowPolicy::Reject),
            Admission::Accepted
        ));
        match inbox.offer(msg("c", Priority::High), InboxOverflowPolicy::Reject) {
            Admission::Full(returned) => assert_eq!(returned.content.as_text(), Some("c")),
            other => panic!("expected Full, got {other:?}"),
        }
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox.high_water(), 2);
    }

    #[test]
    fn drop_oldest_evicts_from_lowest_class() {
        let mut inbox = PriorityInbox::new(2);
        inbox.offer(msg("high", Priority::High), InboxOverflowPolicy::DropOldest);
        inbox.offer(msg("low-1", Priority::Low), InboxOverflowPolicy::DropOldest);

        match inbox.offer(msg("normal", Priority::Normal), InboxOverflowPolicy::DropOldest) {
            Admission::Evicted(dropped) => assert_eq!(dropped.content.as_text(), Some("low-1")),
            other => panic!("expected eviction, got {other:?}"),
        }
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox.depth_of(Priority::Low), 0);
        assert_eq!(text(inbox.pop()), "high");
        assert_eq!(text(inbox.pop()), "normal");
    }

    #[test]
    fn clear_reports_dropped_count() {
        let mut inbox = PriorityInbox::new(0);
        inbox.offer(msg("a", Priority::Low), InboxOverflowPolicy::Reject);
        inbox.offer(msg("b", Priority::High), InboxOverflowPolicy::Reject);
        assert_eq!(inbox.clear(), 2);
        assert!(inbox.is_empty());
        assert_eq!(inbox.high_water(), 2);
    }
}
