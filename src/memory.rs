//! Experience replay for off-policy agents

use std::collections::VecDeque;

use rand::{seq::index::sample, thread_rng};

/// A single transition
///
/// `next_state` is `None` when the transition ended the episode.
#[derive(Debug, Clone)]
pub struct Exp<S> {
    pub state: S,
    pub action: usize,
    pub reward: f32,
    pub next_state: Option<S>,
}

/// A batch of transitions split into parallel vectors
#[derive(Debug, Clone)]
pub struct ExpBatch<S> {
    pub states: Vec<S>,
    pub actions: Vec<usize>,
    pub rewards: Vec<f32>,
    pub next_states: Vec<Option<S>>,
}

impl<S> ExpBatch<S> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            states: Vec::with_capacity(capacity),
            actions: Vec::with_capacity(capacity),
            rewards: Vec::with_capacity(capacity),
            next_states: Vec::with_capacity(capacity),
        }
    }
}

/// Fixed-capacity FIFO replay memory with uniform sampling
#[derive(Debug, Clone)]
pub struct ReplayMemory<S> {
    memory: VecDeque<Exp<S>>,
    capacity: usize,
    pub batch_size: usize,
}

impl<S: Clone> ReplayMemory<S> {
    pub fn new(capacity: usize, batch_size: usize) -> Self {
        Self {
            memory: VecDeque::with_capacity(capacity.min(1 << 16)),
            capacity,
            batch_size,
        }
    }

    /// Store a transition, evicting the oldest one when full
    pub fn push(&mut self, exp: Exp<S>) {
        if self.capacity == 0 {
            return;
        }
        if self.memory.len() == self.capacity {
            self.memory.pop_front();
        }
        self.memory.push_back(exp);
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Sample `batch_size` distinct transitions, or `None` if not enough are stored
    pub fn sample_zipped(&self) -> Option<ExpBatch<S>> {
        if self.batch_size == 0 || self.memory.len() < self.batch_size {
            return None;
        }

        let mut batch = ExpBatch::with_capacity(self.batch_size);
        for i in sample(&mut thread_rng(), self.memory.len(), self.batch_size).iter() {
            let exp = &self.memory[i];
            batch.states.push(exp.state.clone());
            batch.actions.push(exp.action);
            batch.rewards.push(exp.reward);
            batch.next_states.push(exp.next_state.clone());
        }
        Some(batch)
    }
}
