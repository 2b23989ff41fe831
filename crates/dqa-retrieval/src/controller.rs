use crate::scorer::{ScoreOutcome, ScoredMatch};
use dqa_core::AttemptRecord;
use tracing::{debug, info};

/// 重试状态机状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Initial,
    Searching,
    Retrying,
    Accepted,
    Exhausted,
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryState::Accepted | RetryState::Exhausted)
    }
}

/// 单轮检索参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalParams {
    pub top_k: usize,
    pub threshold: f32,
}

/// 重试参数升级策略：先扩大 top_k，再下调阈值
#[derive(Debug, Clone, Copy)]
pub struct EscalationPolicy {
    pub topk_multiplier: usize,
    pub topk_ceiling: usize,
    pub threshold_decrement: f32,
    pub confidence_floor: f32,
}

impl EscalationPolicy {
    pub fn escalate(&self, params: RetrievalParams) -> RetrievalParams {
        // top_k 单调不减：请求值已超过上限时保持不变
        let top_k = params
            .top_k
            .saturating_mul(self.topk_multiplier)
            .min(self.topk_ceiling)
            .max(params.top_k);
        // 阈值单调不增：已低于下限的请求值不被抬升
        let threshold = if params.threshold <= self.confidence_floor {
            params.threshold
        } else {
            (params.threshold - self.threshold_decrement).max(self.confidence_floor)
        };
        RetrievalParams { top_k, threshold }
    }
}

/// 控制器对一轮打分结果的裁决
#[derive(Debug)]
pub enum Decision {
    /// 验收通过，携带通过阈值的匹配
    Accept(Vec<ScoredMatch>),
    /// 置信度不足，按升级后的参数再试一轮
    Retry(RetrievalParams),
    /// 重试预算用尽，返回最优一轮的结果并标记低置信度
    Exhausted {
        matches: Vec<ScoredMatch>,
        confidence: f32,
    },
}

struct BestAttempt {
    confidence: f32,
    accepted: Vec<ScoredMatch>,
}

/// 自校正重试控制器
///
/// `Initial → Searching → {Accepted | Retrying → Searching | Exhausted}`。
/// 每轮依赖上一轮的打分结果，重试严格串行；终态一经到达不再离开。
pub struct SelfCorrectionController {
    policy: EscalationPolicy,
    max_retries: u32,
    min_citations: Option<usize>,
    state: RetryState,
    params: RetrievalParams,
    attempts: Vec<AttemptRecord>,
    best: Option<BestAttempt>,
}

impl SelfCorrectionController {
    pub fn new(
        initial: RetrievalParams,
        policy: EscalationPolicy,
        max_retries: u32,
        min_citations: Option<usize>,
    ) -> Self {
        Self {
            policy,
            max_retries,
            min_citations,
            state: RetryState::Initial,
            params: initial,
            attempts: Vec::new(),
            best: None,
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    /// 进入下一轮检索，返回本轮应使用的参数
    pub fn begin_attempt(&mut self) -> RetrievalParams {
        debug_assert!(!self.state.is_terminal(), "attempt after terminal state");
        self.state = RetryState::Searching;
        self.params
    }

    /// 观察一轮打分结果，记录尝试轨迹并裁决下一步
    pub fn observe(&mut self, outcome: &ScoreOutcome) -> Decision {
        debug_assert_eq!(self.state, RetryState::Searching);

        let accepted = outcome.accepted();
        let attempt_number = self.attempts.len() as u32 + 1;
        self.attempts.push(AttemptRecord {
            attempt_number,
            top_k_used: self.params.top_k,
            threshold_used: self.params.threshold,
            overall_confidence: outcome.overall_confidence,
            accepted_count: accepted.len(),
            total_returned: outcome.matches.len(),
        });

        // 最优一轮按整体置信度取，首轮优先保证可审计
        let is_better = self
            .best
            .as_ref()
            .map(|b| outcome.overall_confidence > b.confidence)
            .unwrap_or(true);
        if is_better {
            self.best = Some(BestAttempt {
                confidence: outcome.overall_confidence,
                accepted: accepted.clone(),
            });
        }

        let confident =
            outcome.overall_confidence >= self.params.threshold && !accepted.is_empty();
        let min_citations_met = self
            .min_citations
            .map(|min| accepted.len() >= min.max(1))
            .unwrap_or(false);

        if confident || min_citations_met {
            self.state = RetryState::Accepted;
            info!(
                attempt = attempt_number,
                overall_confidence = outcome.overall_confidence,
                accepted = accepted.len(),
                "retrieval accepted"
            );
            return Decision::Accept(accepted);
        }

        if attempt_number < self.max_retries {
            self.state = RetryState::Retrying;
            self.params = self.policy.escalate(self.params);
            debug!(
                attempt = attempt_number,
                next_top_k = self.params.top_k,
                next_threshold = self.params.threshold,
                "confidence insufficient, escalating retrieval parameters"
            );
            return Decision::Retry(self.params);
        }

        self.state = RetryState::Exhausted;
        let best = self.best.take().unwrap_or(BestAttempt {
            confidence: 0.0,
            accepted: Vec::new(),
        });
        info!(
            attempts = self.attempts.len(),
            best_confidence = best.confidence,
            "retry budget exhausted, returning best attempt"
        );
        Decision::Exhausted {
            matches: best.accepted,
            confidence: best.confidence,
        }
    }

    /// 截止期在检索途中耗尽：以当前最优一轮直接收束
    pub fn abort_on_deadline(&mut self) -> (Vec<ScoredMatch>, f32) {
        self.state = RetryState::Exhausted;
        match self.best.take() {
            Some(best) => (best.accepted, best.confidence),
            None => (Vec::new(), 0.0),
        }
    }
}
