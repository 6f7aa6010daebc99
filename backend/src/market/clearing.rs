//! Combinatorial day-ahead auction
//!
//! # Model
//!
//! - Single and linked (non-root) asks: continuous activation in [0, 1]
//! - Root linked blocks ("mother" orders): all-or-nothing gates
//! - Exclusive blocks: at most one per agent, accepted in full
//! - Bids: always cleared in full
//! - Source / sink: unlimited, penalized at `penalty_price`, so every
//!   hour balances
//!
//! The binary part (gates and exclusive choices) is enumerated when small
//! enough and searched by best-improvement local search otherwise. For a
//! fixed binary assignment the continuous part is a linear program:
//!
//! ```text
//! min  Σ price·volume·x + penalty·Σ (source + sink)
//! s.t. Σ volume·x + source − sink = open demand      (every hour)
//!      x_child ≤ Σ volume·x / Σ volume  over the parent block
//!      0 ≤ x ≤ 1,  source, sink ≥ 0
//! ```
//!
//! so a pricier parent is accepted whenever it unlocks cheaper children.
//! Only exhaustive enumeration with every LP solved yields `Optimal`; local
//! search or a merit-order fallback after a failed LP yields `Degraded`.
//!
//! # Critical Invariants
//!
//! 1. Per hour: accepted supply + source == cleared demand + sink
//! 2. A linked block's activation never exceeds its parent's
//! 3. At most one exclusive block per agent is accepted
//! 4. Clearing the same book twice yields the same result

use super::result::{
    Acceptance, BlockActivation, ClearingResult, ClearingStatus, ClearingWarning, HourResult, OrderKind,
    Rejection,
};
use crate::config::MarketConfig;
use crate::core::time::HOURS_PER_DAY;
use crate::models::order::{OrderBook, OrderKey};
use chrono::NaiveDate;
use good_lp::{
    constraint, default_solver, variable, Expression, ProblemVariables, ResolutionError, Solution, SolverModel,
    Variable,
};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use tracing::{debug, info, instrument, warn};

pub struct MarketClearingEngine {
    config: MarketConfig,
}

impl MarketClearingEngine {
    pub fn new(config: MarketConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    /// Clear one delivery day
    ///
    /// Agents whose orders fail validation are removed first and listed in
    /// [`ClearingResult::rejected`].
    #[instrument(skip_all, fields(date = %date))]
    pub fn clear(&self, date: NaiveDate, book: &OrderBook) -> ClearingResult {
        let validated = book.validate();
        for error in &validated.rejected {
            warn!(agent = error.agent_id(), %error, "agent dropped from auction");
        }

        let auction = Auction::new(&validated.book);
        let (decision, status) = self.search(&auction);
        let evaluation = auction.evaluate(&decision, &self.config);
        let rejected = validated
            .rejected
            .iter()
            .map(|error| Rejection {
                agent_id: error.agent_id().to_string(),
                reason: error.to_string(),
            })
            .collect();
        let result = auction.result(date, status, &decision, evaluation, rejected, &self.config);

        for warning in &result.warnings {
            warn!(?warning, "clearing warning");
        }
        info!(
            mean_price = result.mean_price(),
            traded = result.traded_volume(),
            source = result.source_volume(),
            sink = result.sink_volume(),
            status = ?result.status,
            "market cleared"
        );
        result
    }

    /// Best binary assignment and whether it is proven optimal
    fn search(&self, auction: &Auction) -> (Decision, ClearingStatus) {
        let radices = auction.radices();
        let combinations = radices.iter().try_fold(1usize, |acc, &r| acc.checked_mul(r));
        match combinations {
            Some(n) if n <= self.config.exhaustive_limit => {
                debug!(combinations = n, "exhaustive block search");
                self.exhaustive(auction, &radices, n)
            }
            _ => {
                debug!(binaries = radices.len(), "local block search");
                (self.local_search(auction), ClearingStatus::Degraded)
            }
        }
    }

    fn exhaustive(&self, auction: &Auction, radices: &[usize], combinations: usize) -> (Decision, ClearingStatus) {
        let mut best: Option<(Decision, f64)> = None;
        let mut exact = true;
        for code in 0..combinations {
            let decision = auction.decode(code, radices);
            let evaluation = auction.evaluate(&decision, &self.config);
            exact &= evaluation.exact;
            let better = best
                .as_ref()
                .map_or(true, |(_, best_cost)| evaluation.cost < best_cost - self.config.tolerance);
            if better {
                best = Some((decision, evaluation.cost));
            }
        }
        let decision = best
            .map(|(decision, _)| decision)
            .unwrap_or_else(|| auction.initial());
        let status = if exact {
            ClearingStatus::Optimal
        } else {
            ClearingStatus::Degraded
        };
        (decision, status)
    }

    /// Best-improvement descent; a local minimum carries no optimality proof
    fn local_search(&self, auction: &Auction) -> Decision {
        let mut current = auction.initial();
        let mut current_cost = auction.evaluate(&current, &self.config).cost;

        for pass in 0..self.config.max_search_passes {
            let mut best: Option<(Decision, f64)> = None;
            for candidate in auction.neighbours(&current) {
                let cost = auction.evaluate(&candidate, &self.config).cost;
                let reference = best.as_ref().map_or(current_cost, |(_, c)| *c);
                if cost < reference - self.config.tolerance {
                    best = Some((candidate, cost));
                }
            }
            match best {
                Some((decision, cost)) => {
                    current = decision;
                    current_cost = cost;
                }
                None => {
                    debug!(passes = pass + 1, "local search converged");
                    return current;
                }
            }
        }
        warn!(
            passes = self.config.max_search_passes,
            "block search budget exhausted"
        );
        current
    }
}

// ============================================================================
// Auction model
// ============================================================================

struct Ask {
    key: OrderKey,
    kind: OrderKind,
    price: f64,
    volume: f64,
    /// Linked block, `None` for single asks
    block: Option<usize>,
}

struct Block {
    agent_id: String,
    block_id: u32,
    parent: Option<usize>,
    children: Vec<usize>,
    asks: Vec<usize>,
    volume: f64,
}

struct ExclusiveOrder {
    key: OrderKey,
    price: f64,
    volume: f64,
}

struct ExclusiveAgent {
    blocks: Vec<Vec<ExclusiveOrder>>,
}

/// Values of every binary variable
#[derive(Debug, Clone, PartialEq)]
struct Decision {
    /// One per root block, in `Auction::gates` order
    gates: Vec<bool>,
    /// One per exclusive agent: index into its blocks
    choice: Vec<Option<usize>>,
}

struct Evaluation {
    cost: f64,
    activation: Vec<f64>,
    block_activation: Vec<f64>,
    /// Demand minus supply per hour: positive is source, negative is sink
    residual: [f64; HOURS_PER_DAY],
    /// Continuous part solved by the LP rather than the fallback fill
    exact: bool,
}

struct Auction {
    asks: Vec<Ask>,
    /// Ask indices in merit order
    merit: Vec<usize>,
    /// Merit position of every ask
    rank: Vec<usize>,
    blocks: Vec<Block>,
    /// Root blocks
    gates: Vec<usize>,
    /// Blocks with every parent before its children
    topo: Vec<usize>,
    exclusive: Vec<ExclusiveAgent>,
    bids: Vec<(OrderKey, f64, f64)>,
    demand: [f64; HOURS_PER_DAY],
    has_asks: [bool; HOURS_PER_DAY],
    has_bids: [bool; HOURS_PER_DAY],
}

impl Auction {
    fn new(book: &OrderBook) -> Self {
        let mut asks = Vec::new();
        for (key, order) in book.single_asks() {
            asks.push(Ask {
                key: key.clone(),
                kind: OrderKind::Single,
                price: order.price,
                volume: order.volume,
                block: None,
            });
        }

        // blocks ordered by (agent, block id)
        let mut grouped: BTreeMap<(String, u32), Vec<(OrderKey, f64, f64, Option<u32>)>> = BTreeMap::new();
        for (key, order) in book.linked_asks() {
            grouped
                .entry((key.agent_id.clone(), key.block_id))
                .or_default()
                .push((key.clone(), order.price, order.volume, order.parent));
        }
        let index: BTreeMap<(String, u32), usize> =
            grouped.keys().cloned().enumerate().map(|(i, k)| (k, i)).collect();

        let mut blocks = Vec::with_capacity(grouped.len());
        for ((agent_id, block_id), orders) in grouped {
            let parent = orders
                .first()
                .and_then(|o| o.3)
                .and_then(|p| index.get(&(agent_id.clone(), p)).copied());
            let block = blocks.len();
            let mut members = Vec::with_capacity(orders.len());
            let mut volume = 0.0;
            for (key, price, order_volume, _) in orders {
                members.push(asks.len());
                volume += order_volume;
                asks.push(Ask {
                    key,
                    kind: OrderKind::Linked,
                    price,
                    volume: order_volume,
                    block: Some(block),
                });
            }
            blocks.push(Block {
                agent_id,
                block_id,
                parent,
                children: Vec::new(),
                asks: members,
                volume,
            });
        }
        for child in 0..blocks.len() {
            if let Some(parent) = blocks[child].parent {
                blocks[parent].children.push(child);
            }
        }
        let gates: Vec<usize> = (0..blocks.len()).filter(|&b| blocks[b].parent.is_none()).collect();
        let mut topo = gates.clone();
        let mut next = 0;
        while next < topo.len() {
            topo.extend(blocks[topo[next]].children.iter().copied());
            next += 1;
        }

        let mut merit: Vec<usize> = (0..asks.len()).collect();
        merit.sort_by(|&a, &b| merit_order(&asks[a], &asks[b]));
        let mut rank = vec![0; asks.len()];
        for (position, &ask) in merit.iter().enumerate() {
            rank[ask] = position;
        }

        let mut exclusive_grouped: BTreeMap<String, BTreeMap<u32, Vec<ExclusiveOrder>>> = BTreeMap::new();
        for (key, order) in book.exclusive_asks() {
            exclusive_grouped
                .entry(key.agent_id.clone())
                .or_default()
                .entry(key.block_id)
                .or_default()
                .push(ExclusiveOrder {
                    key: key.clone(),
                    price: order.price,
                    volume: order.volume,
                });
        }
        let exclusive = exclusive_grouped
            .into_values()
            .map(|blocks| ExclusiveAgent {
                blocks: blocks.into_values().collect(),
            })
            .collect();

        let mut demand = [0.0; HOURS_PER_DAY];
        let mut bids = Vec::with_capacity(book.bids().len());
        for (key, bid) in book.bids() {
            demand[key.hour] += bid.volume;
            bids.push((key.clone(), bid.price, bid.volume));
        }

        let mut has_asks = [false; HOURS_PER_DAY];
        let mut has_bids = [false; HOURS_PER_DAY];
        for (hour, entry) in book.hour_index().iter().enumerate() {
            has_asks[hour] = entry.has_asks();
            has_bids[hour] = entry.has_bids();
        }

        Self {
            asks,
            merit,
            rank,
            blocks,
            gates,
            topo,
            exclusive,
            bids,
            demand,
            has_asks,
            has_bids,
        }
    }

    /// Options per binary variable: gates first, then exclusive agents
    fn radices(&self) -> Vec<usize> {
        self.gates
            .iter()
            .map(|_| 2)
            .chain(self.exclusive.iter().map(|agent| agent.blocks.len() + 1))
            .collect()
    }

    fn decode(&self, mut code: usize, radices: &[usize]) -> Decision {
        let mut digits = radices.iter().map(|&radix| {
            let digit = code % radix;
            code /= radix;
            digit
        });
        let gates = (0..self.gates.len())
            .map(|_| digits.next() == Some(0))
            .collect();
        let choice = (0..self.exclusive.len())
            .map(|_| digits.next().and_then(|d| d.checked_sub(1)))
            .collect();
        Decision { gates, choice }
    }

    /// Every gate open, no exclusive block
    fn initial(&self) -> Decision {
        Decision {
            gates: vec![true; self.gates.len()],
            choice: vec![None; self.exclusive.len()],
        }
    }

    /// Decisions differing from `current` in one variable
    fn neighbours(&self, current: &Decision) -> Vec<Decision> {
        let mut out = Vec::new();
        for i in 0..current.gates.len() {
            let mut next = current.clone();
            next.gates[i] = !next.gates[i];
            out.push(next);
        }
        for (agent, blocks) in self.exclusive.iter().enumerate() {
            let options = std::iter::once(None).chain((0..blocks.blocks.len()).map(Some));
            for option in options {
                if option != current.choice[agent] {
                    let mut next = current.clone();
                    next.choice[agent] = option;
                    out.push(next);
                }
            }
        }
        out
    }

    /// Whether each block can carry volume: open gate on its root
    fn live_blocks(&self, decision: &Decision) -> Vec<bool> {
        let mut live = vec![false; self.blocks.len()];
        for (&block, &open) in self.gates.iter().zip(&decision.gates) {
            live[block] = open;
        }
        for &block in &self.topo {
            if let Some(parent) = self.blocks[block].parent {
                live[block] = live[parent];
            }
        }
        live
    }

    /// Asks with a continuous activation: singles and non-root linked asks
    fn is_free(&self, ask: &Ask) -> bool {
        ask.block.map_or(true, |b| self.blocks[b].parent.is_some())
    }

    fn evaluate(&self, decision: &Decision, config: &MarketConfig) -> Evaluation {
        let mut residual = self.demand;
        let mut cost = 0.0;
        let mut activation = vec![0.0; self.asks.len()];

        // charging adds to demand and is not costed
        for (agent, choice) in self.exclusive.iter().zip(&decision.choice) {
            let Some(block) = choice.and_then(|c| agent.blocks.get(c)) else {
                continue;
            };
            for order in block {
                residual[order.key.hour] -= order.volume;
                if order.volume > 0.0 {
                    cost += order.price * order.volume;
                }
            }
        }

        for (&block, &open) in self.gates.iter().zip(&decision.gates) {
            if !open {
                continue;
            }
            for &ask in &self.blocks[block].asks {
                let order = &self.asks[ask];
                activation[ask] = 1.0;
                residual[order.key.hour] -= order.volume;
                cost += order.price * order.volume;
            }
        }

        let live = self.live_blocks(decision);
        let exact = match self.dispatch(&live, &residual, config) {
            Ok(shares) => {
                for (ask, share) in shares {
                    activation[ask] = share;
                }
                true
            }
            Err(error) => {
                debug!(%error, "continuous dispatch failed, falling back to merit order");
                self.merit_fill(&live, &residual, &mut activation, config.tolerance);
                false
            }
        };
        let block_activation = self.cap_activations(&live, &mut activation, config.tolerance);

        for (index, ask) in self.asks.iter().enumerate() {
            if self.is_free(ask) && activation[index] > 0.0 {
                residual[ask.key.hour] -= activation[index] * ask.volume;
                cost += activation[index] * ask.price * ask.volume;
            }
        }

        let imbalance: f64 = residual.iter().map(|r| r.abs()).sum();
        cost += config.penalty_price * imbalance;
        Evaluation {
            cost,
            activation,
            block_activation,
            residual,
            exact,
        }
    }

    /// Cheapest activation of the free asks against the open demand
    fn dispatch(
        &self,
        live: &[bool],
        residual: &[f64; HOURS_PER_DAY],
        config: &MarketConfig,
    ) -> Result<Vec<(usize, f64)>, ResolutionError> {
        let mut vars = ProblemVariables::new();
        let source = vars.add_vector(variable().min(0.0), HOURS_PER_DAY);
        let sink = vars.add_vector(variable().min(0.0), HOURS_PER_DAY);

        let mut shares: Vec<(usize, Variable)> = Vec::new();
        for (index, ask) in self.asks.iter().enumerate() {
            let usable = self.is_free(ask) && ask.block.map_or(true, |b| live[b]) && ask.volume > 0.0;
            if usable {
                shares.push((index, vars.add(variable().min(0.0).max(1.0))));
            }
        }

        let mut objective: Expression = source
            .iter()
            .chain(&sink)
            .map(|&v| config.penalty_price * v)
            .sum();
        let mut balance: Vec<Expression> = (0..HOURS_PER_DAY).map(|h| source[h] - sink[h]).collect();
        let mut parent_share: Vec<Expression> = self.blocks.iter().map(|_| Expression::from(0.0)).collect();
        for &(index, x) in &shares {
            let ask = &self.asks[index];
            objective += ask.price * ask.volume * x;
            balance[ask.key.hour] += ask.volume * x;
            if let Some(block) = ask.block {
                let total = self.blocks[block].volume;
                if total > 0.0 {
                    parent_share[block] += (ask.volume / total) * x;
                }
            }
        }

        let mut problem = vars.minimise(objective).using(default_solver);
        for (hour, expression) in balance.into_iter().enumerate() {
            let open = residual[hour];
            problem = problem.with(constraint!(expression == open));
        }
        for &(index, x) in &shares {
            let Some(parent) = self.asks[index].block.and_then(|b| self.blocks[b].parent) else {
                continue;
            };
            // root parents are fully on once live
            if self.blocks[parent].parent.is_some() {
                let cap = parent_share[parent].clone();
                problem = problem.with(constraint!(x <= cap));
            }
        }

        let solution = problem.solve()?;
        Ok(shares
            .into_iter()
            .map(|(index, x)| (index, solution.value(x)))
            .collect())
    }

    /// Greedy merit-order fill, used when the LP cannot be solved
    fn merit_fill(&self, live: &[bool], residual: &[f64; HOURS_PER_DAY], activation: &mut [f64], tolerance: f64) {
        let mut open = *residual;
        let mut block_activation = vec![0.0; self.blocks.len()];
        let mut accepted = vec![0.0; self.blocks.len()];
        let mut pending: Vec<usize> = self.blocks.iter().map(|b| b.asks.len()).collect();
        let mut heap = BinaryHeap::new();

        for &block in &self.gates {
            if live[block] {
                block_activation[block] = 1.0;
                self.release(block, &mut heap);
            }
        }
        for (index, ask) in self.asks.iter().enumerate() {
            if ask.block.is_none() {
                heap.push(Reverse(self.rank[index]));
            }
        }

        while let Some(Reverse(position)) = heap.pop() {
            let index = self.merit[position];
            let ask = &self.asks[index];
            let cap = ask
                .block
                .and_then(|b| self.blocks[b].parent)
                .map_or(1.0, |p| block_activation[p]);
            let need = open[ask.key.hour];
            let share = if need > tolerance && ask.volume > 0.0 {
                (need / ask.volume).min(cap).max(0.0)
            } else {
                0.0
            };
            activation[index] = share;
            open[ask.key.hour] -= share * ask.volume;

            if let Some(block) = ask.block {
                accepted[block] += share * ask.volume;
                pending[block] -= 1;
                if pending[block] == 0 {
                    let total = self.blocks[block].volume;
                    block_activation[block] = if total > 0.0 { accepted[block] / total } else { 0.0 };
                    if block_activation[block] > tolerance {
                        self.release(block, &mut heap);
                    }
                }
            }
        }
    }

    fn release(&self, block: usize, heap: &mut BinaryHeap<Reverse<usize>>) {
        for &child in &self.blocks[block].children {
            for &ask in &self.blocks[child].asks {
                heap.push(Reverse(self.rank[ask]));
            }
        }
    }

    /// Clamp solver output onto the feasible set exactly: shares within
    /// tolerance of zero vanish and no child exceeds its parent. Returns
    /// the activation of every block.
    fn cap_activations(&self, live: &[bool], activation: &mut [f64], tolerance: f64) -> Vec<f64> {
        let snap = |share: f64, cap: f64| if share <= tolerance { 0.0 } else { share.min(cap) };
        for (index, ask) in self.asks.iter().enumerate() {
            if ask.block.is_none() {
                activation[index] = snap(activation[index], 1.0);
            }
        }

        let mut block_activation = vec![0.0; self.blocks.len()];
        for &block in &self.topo {
            let cap = match self.blocks[block].parent {
                None => {
                    block_activation[block] = if live[block] { 1.0 } else { 0.0 };
                    continue;
                }
                Some(_) if !live[block] => 0.0,
                Some(parent) => block_activation[parent],
            };
            let mut accepted = 0.0;
            for &ask in &self.blocks[block].asks {
                activation[ask] = snap(activation[ask], cap);
                accepted += activation[ask] * self.asks[ask].volume;
            }
            let total = self.blocks[block].volume;
            block_activation[block] = if total > 0.0 { (accepted / total).min(cap) } else { 0.0 };
        }
        block_activation
    }

    fn result(
        &self,
        date: NaiveDate,
        status: ClearingStatus,
        decision: &Decision,
        evaluation: Evaluation,
        rejected: Vec<Rejection>,
        config: &MarketConfig,
    ) -> ClearingResult {
        let tolerance = config.tolerance;
        let mut acceptances = Vec::with_capacity(self.asks.len() + self.bids.len());
        let mut supply = [0.0; HOURS_PER_DAY];
        let mut demand = self.demand;
        let mut marginal: [Option<f64>; HOURS_PER_DAY] = [None; HOURS_PER_DAY];
        let mut mother: [Option<f64>; HOURS_PER_DAY] = [None; HOURS_PER_DAY];
        let raise = |slot: &mut Option<f64>, price: f64| *slot = Some(slot.map_or(price, |p| p.max(price)));

        for (index, ask) in self.asks.iter().enumerate() {
            let share = evaluation.activation[index];
            let hour = ask.key.hour;
            if share > tolerance {
                supply[hour] += share * ask.volume;
                let is_root = ask.block.map_or(false, |b| self.blocks[b].parent.is_none());
                if is_root {
                    raise(&mut mother[hour], ask.price);
                } else {
                    raise(&mut marginal[hour], ask.price);
                }
            }
            acceptances.push(Acceptance {
                key: ask.key.clone(),
                kind: ask.kind,
                price: ask.price,
                volume: ask.volume,
                activation: share,
            });
        }

        for (agent, choice) in self.exclusive.iter().zip(&decision.choice) {
            for (index, block) in agent.blocks.iter().enumerate() {
                let selected = *choice == Some(index);
                for order in block {
                    if selected {
                        if order.volume > tolerance {
                            supply[order.key.hour] += order.volume;
                            raise(&mut marginal[order.key.hour], order.price);
                        } else {
                            demand[order.key.hour] -= order.volume;
                        }
                    }
                    acceptances.push(Acceptance {
                        key: order.key.clone(),
                        kind: OrderKind::Exclusive,
                        price: order.price,
                        volume: order.volume,
                        activation: if selected { 1.0 } else { 0.0 },
                    });
                }
            }
        }

        for (key, price, volume) in &self.bids {
            acceptances.push(Acceptance {
                key: key.clone(),
                kind: OrderKind::Bid,
                price: *price,
                volume: *volume,
                activation: 1.0,
            });
        }

        let mut warnings = Vec::new();
        let mut hours = Vec::with_capacity(HOURS_PER_DAY);
        for hour in 0..HOURS_PER_DAY {
            let source = evaluation.residual[hour].max(0.0);
            let sink = (-evaluation.residual[hour]).max(0.0);
            if !self.has_asks[hour] {
                warnings.push(ClearingWarning::NoAsks { hour });
            }
            if !self.has_bids[hour] {
                warnings.push(ClearingWarning::NoBids { hour });
            }
            if source > tolerance {
                warnings.push(ClearingWarning::MagicSourceUsed { hour, volume: source });
            }
            if sink > tolerance {
                warnings.push(ClearingWarning::MagicSinkUsed { hour, volume: sink });
            }

            let price = marginal[hour].or(mother[hour]).unwrap_or(if source > tolerance {
                config.max_price
            } else if sink > tolerance {
                config.min_price
            } else {
                0.0
            });
            hours.push(HourResult {
                hour,
                price,
                supply: supply[hour],
                demand: demand[hour],
                source,
                sink,
            });
        }

        let blocks = self
            .blocks
            .iter()
            .enumerate()
            .map(|(index, block)| BlockActivation {
                agent_id: block.agent_id.clone(),
                block_id: block.block_id,
                parent: block.parent.map(|p| self.blocks[p].block_id),
                activation: evaluation.block_activation[index],
            })
            .collect();

        ClearingResult {
            date,
            status,
            objective: evaluation.cost,
            hours,
            acceptances,
            blocks,
            warnings,
            rejected,
        }
    }
}

/// (price, block id, agent, hour, order id)
fn merit_order(a: &Ask, b: &Ask) -> Ordering {
    a.price
        .total_cmp(&b.price)
        .then(a.key.block_id.cmp(&b.key.block_id))
        .then_with(|| a.key.agent_id.cmp(&b.key.agent_id))
        .then(a.key.hour.cmp(&b.key.hour))
        .then(a.key.order_id.cmp(&b.key.order_id))
}
