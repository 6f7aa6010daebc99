//! Linked block orders for thermal plants
//!
//! The step schedules of [`StepResults`] describe how the plant's output
//! grows with the price. Walking the steps in ascending price order, every
//! increase in output becomes an order linked to the block that already
//! covers the hour:
//!
//! ```text
//! step k:      ████████████            mother block (min power, block 0)
//! step k+1:   ░████████████░           left/right runs chain to neighbours
//! step k+1:    ▒▒▒▒▒▒▒▒▒▒▒▒            stack on top of the hour's last block
//! ```
//!
//! # Critical Invariants
//!
//! 1. Block ids are contiguous from 0 and every parent id is smaller than
//!    its child's, so block 0 is always a root
//! 2. No order is priced below any order of its parent block
//! 3. All prices lie within the market's price bounds

use crate::config::{BiddingConfig, MarketConfig, PriceStep};
use crate::core::time::HOURS_PER_DAY;
use crate::models::asset::ThermalAsset;
use crate::models::order::{LinkedOrder, OrderBook, OrderKey};
use crate::optimizer::thermal::{PreventedStart, StepDispatch, StepResults};
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Piece {
    hour: usize,
    price: f64,
    volume: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Block {
    parent: Option<usize>,
    pieces: Vec<Piece>,
}

/// Builds the linked-order forest of one thermal asset
pub struct OrderBookBuilder<'a> {
    asset: &'a ThermalAsset,
    bidding: &'a BiddingConfig,
    market: &'a MarketConfig,
}

impl<'a> OrderBookBuilder<'a> {
    pub fn new(asset: &'a ThermalAsset, bidding: &'a BiddingConfig, market: &'a MarketConfig) -> Self {
        Self {
            asset,
            bidding,
            market,
        }
    }

    pub fn build(&self, results: &StepResults) -> OrderBook {
        let mut forest = Forest::new(self, &results.marginal_cost);
        for step in &results.steps {
            forest.add_step(step);
        }
        if let Some(prevented) = &results.prevented_start {
            forest.prevent_shutdown(prevented);
        }
        let blocks = forest.finish();

        let mut book = OrderBook::new();
        for (block_id, block) in blocks.iter().enumerate() {
            let mut per_hour = [0u32; HOURS_PER_DAY];
            for piece in &block.pieces {
                let order_id = per_hour[piece.hour];
                per_hour[piece.hour] += 1;
                book.add_linked(
                    OrderKey::new(block_id as u32, piece.hour, order_id, self.asset.id.as_str()),
                    LinkedOrder::new(piece.price, piece.volume, block.parent.map(|p| p as u32)),
                );
            }
        }
        debug!(
            asset = %self.asset.id,
            blocks = blocks.len(),
            orders = book.linked_asks().len(),
            "linked order book built"
        );
        book
    }
}

/// Working state while walking the steps
struct Forest<'b> {
    builder: &'b OrderBookBuilder<'b>,
    marginal_cost: &'b [f64],
    blocks: Vec<Block>,
    /// Power already offered per hour
    known: [f64; HOURS_PER_DAY],
    /// Most recent block covering each hour
    links: [Option<usize>; HOURS_PER_DAY],
}

impl<'b> Forest<'b> {
    fn new(builder: &'b OrderBookBuilder<'b>, marginal_cost: &'b [f64]) -> Self {
        Self {
            builder,
            marginal_cost,
            blocks: Vec::new(),
            known: [0.0; HOURS_PER_DAY],
            links: [None; HOURS_PER_DAY],
        }
    }

    fn min_power(&self) -> f64 {
        self.builder.asset.params.min_power
    }

    fn min_volume(&self) -> f64 {
        self.builder.bidding.min_order_volume
    }

    fn cost(&self, hour: usize) -> f64 {
        self.marginal_cost.get(hour).copied().unwrap_or(0.0)
    }

    fn push(&mut self, parent: Option<usize>, pieces: Vec<Piece>) -> usize {
        self.blocks.push(Block { parent, pieces });
        self.blocks.len() - 1
    }

    fn add_step(&mut self, step: &StepDispatch) {
        let power = &step.dispatch.power;
        let limit = power.len().min(HOURS_PER_DAY);
        let price_of = |forest: &Self, hour: usize| match step.step {
            PriceStep::Offset(_) => forest.cost(hour).max(step.prices[hour]),
            PriceStep::RunAtMax => forest.cost(hour),
        };

        let offered = self.known.iter().any(|&p| p > 0.0);
        if !offered {
            let hours: Vec<usize> = (0..limit).filter(|&h| power[h] > self.min_volume()).collect();
            if hours.is_empty() {
                return;
            }
            self.add_root(&hours, step.dispatch.cash_flow.start);
        }

        // stack on top of hours already offered
        for hour in 0..limit {
            let delta = power[hour] - self.known[hour];
            if self.known[hour] > 0.0 && delta > self.min_volume() {
                let price = price_of(self, hour);
                self.add_split(hour, delta, price, self.links[hour]);
            }
        }

        // runs of newly offered hours
        let fresh: Vec<usize> = (0..limit)
            .filter(|&h| self.known[h] <= 0.0 && power[h] > self.min_volume())
            .collect();
        for run in contiguous_runs(&fresh) {
            let (first, last) = (run[0], run[run.len() - 1]);
            let left = first.checked_sub(1).and_then(|h| self.links[h]);
            let right = self.links.get(last + 1).copied().flatten();

            if left.is_some() {
                for &hour in &run {
                    let delta = power[hour] - self.known[hour];
                    if delta > self.min_volume() {
                        let price = price_of(self, hour);
                        let parent = self.links[hour].or(self.links[hour - 1]);
                        self.add_split(hour, delta, price, parent);
                    }
                }
            } else if right.is_some() {
                for &hour in run.iter().rev() {
                    let delta = power[hour] - self.known[hour];
                    if delta > self.min_volume() {
                        let price = price_of(self, hour);
                        let parent = self.links[hour].or(self.links[hour + 1]);
                        self.add_split(hour, delta, price, parent);
                    }
                }
            } else {
                // isolated start later in the day
                self.add_root(&run, self.builder.asset.params.start_cost);
                for &hour in &run {
                    let delta = power[hour] - self.known[hour];
                    if delta > self.min_volume() {
                        let price = price_of(self, hour);
                        self.add_split(hour, delta, price, self.links[hour]);
                    }
                }
            }
        }
    }

    /// Root block at minimum power over `hours`, extended to the minimum run
    /// time, start cost amortized over its volume
    fn add_root(&mut self, hours: &[usize], start_cost: f64) {
        let hours = self.extend_to_min_run(hours);
        let n = hours.len() as f64;
        let mean_cost = hours.iter().map(|&h| self.cost(h)).sum::<f64>() / n;
        let price = mean_cost + start_cost / (self.min_power() * n);

        let pieces = hours
            .iter()
            .map(|&hour| Piece {
                hour,
                price,
                volume: self.min_power(),
            })
            .collect();
        let block = self.push(None, pieces);
        for &hour in &hours {
            self.known[hour] = self.min_power();
            self.links[hour] = Some(block);
        }
    }

    /// Add unoffered hours after (then before) `hours` until the block
    /// covers the minimum run time
    fn extend_to_min_run(&self, hours: &[usize]) -> Vec<usize> {
        let needed = self.builder.asset.params.min_run_time;
        let mut set: BTreeSet<usize> = hours.iter().copied().collect();
        let free = |h: usize| self.links[h].is_none();

        if let (Some(&first), Some(&last)) = (set.first(), set.last()) {
            let mut hour = last + 1;
            while set.len() < needed && hour < HOURS_PER_DAY && free(hour) {
                set.insert(hour);
                hour += 1;
            }
            let mut hour = first;
            while set.len() < needed && hour > 0 && free(hour - 1) {
                hour -= 1;
                set.insert(hour);
            }
        }
        set.into_iter().collect()
    }

    /// One block of `sub_orders` equal pieces in `hour`
    fn add_split(&mut self, hour: usize, volume: f64, price: f64, parent: Option<usize>) {
        let parts = self.builder.bidding.sub_orders.max(1);
        let piece = Piece {
            hour,
            price,
            volume: volume / parts as f64,
        };
        let block = self.push(parent, vec![piece; parts]);
        self.known[hour] += volume;
        self.links[hour] = Some(block);
    }

    /// Re-root the flagged hours under a discounted minimum-power block
    fn prevent_shutdown(&mut self, prevented: &PreventedStart) {
        let mut hours: Vec<usize> = prevented
            .hours
            .iter()
            .copied()
            .filter(|&h| h < HOURS_PER_DAY)
            .collect();
        let Some(&first) = hours.first() else {
            return;
        };
        let needed = self.builder.asset.params.min_run_time;
        let mut hour = first;
        while hours.len() < needed && hour > 0 {
            hour -= 1;
            hours.push(hour);
        }
        hours.sort_unstable();
        let flagged: BTreeSet<usize> = hours.iter().copied().collect();

        // pull existing pieces out of the flagged hours
        let mut removed: Vec<(usize, Piece)> = Vec::new();
        for (index, block) in self.blocks.iter_mut().enumerate() {
            let (taken, kept): (Vec<Piece>, Vec<Piece>) = std::mem::take(&mut block.pieces)
                .into_iter()
                .partition(|p| flagged.contains(&p.hour));
            block.pieces = kept;
            removed.extend(taken.into_iter().map(|p| (index, p)));
        }

        let n = hours.len() as f64;
        let mean_cost = hours.iter().map(|&h| self.cost(h)).sum::<f64>() / n;
        let price = mean_cost - prevented.discount;
        let pieces = hours
            .iter()
            .map(|&hour| Piece {
                hour,
                price,
                volume: self.min_power(),
            })
            .collect();
        let root = self.push(None, pieces);

        for &hour in &hours {
            let mut in_hour: Vec<&(usize, Piece)> = removed.iter().filter(|(_, p)| p.hour == hour).collect();
            in_hour.sort_by(|a, b| a.1.price.total_cmp(&b.1.price).then(a.0.cmp(&b.0)));

            let mut covered = self.min_power();
            let mut parent = root;
            for (_, piece) in in_hour {
                let consumed = covered.min(piece.volume);
                covered -= consumed;
                let leftover = piece.volume - consumed;
                if leftover > self.min_volume() {
                    parent = self.push(
                        Some(parent),
                        vec![Piece {
                            volume: leftover,
                            ..*piece
                        }],
                    );
                }
            }
            self.links[hour] = Some(parent);
        }
        self.orphans_to(root);
    }

    /// Blocks whose ancestors lost all pieces hang from the nearest
    /// surviving ancestor, or from `root` if none is left
    fn orphans_to(&mut self, root: usize) {
        let empty: Vec<bool> = self.blocks.iter().map(|b| b.pieces.is_empty()).collect();
        for index in 0..self.blocks.len() {
            let mut parent = self.blocks[index].parent;
            let mut reparented = false;
            while let Some(p) = parent {
                if !empty[p] {
                    break;
                }
                parent = self.blocks[p].parent;
                reparented = true;
            }
            if reparented {
                self.blocks[index].parent = Some(parent.unwrap_or(root));
            }
        }
    }

    /// Drop empty blocks, renumber parents-first, make prices monotone along
    /// every chain and clip them to the market bounds
    fn finish(self) -> Vec<Block> {
        let blocks = self.blocks;
        let alive: Vec<usize> = (0..blocks.len()).filter(|&i| !blocks[i].pieces.is_empty()).collect();

        // parents first, ties by creation order
        let mut order = Vec::with_capacity(alive.len());
        let mut placed = vec![false; blocks.len()];
        let mut pending: BTreeSet<usize> = alive.iter().copied().collect();
        while !pending.is_empty() {
            let ready: Vec<usize> = pending
                .iter()
                .copied()
                .filter(|&i| blocks[i].parent.map_or(true, |p| placed[p] || blocks[p].pieces.is_empty()))
                .collect();
            if ready.is_empty() {
                // cannot happen for a forest; keep what is placeable
                break;
            }
            for i in ready {
                placed[i] = true;
                pending.remove(&i);
                order.push(i);
            }
        }

        let mut new_id = vec![usize::MAX; blocks.len()];
        for (id, &old) in order.iter().enumerate() {
            new_id[old] = id;
        }

        let market = self.builder.market;
        let mut out: Vec<Block> = Vec::with_capacity(order.len());
        for &old in &order {
            let parent = blocks[old]
                .parent
                .filter(|&p| new_id[p] != usize::MAX)
                .map(|p| new_id[p]);
            let floor = parent.map(|p| {
                out[p]
                    .pieces
                    .iter()
                    .map(|piece| piece.price)
                    .fold(f64::NEG_INFINITY, f64::max)
            });
            let pieces = blocks[old]
                .pieces
                .iter()
                .map(|piece| {
                    let price = floor.map_or(piece.price, |f| piece.price.max(f));
                    Piece {
                        price: price.clamp(market.min_price, market.max_price),
                        ..*piece
                    }
                })
                .collect();
            out.push(Block { parent, pieces });
        }
        out
    }
}

/// Split sorted hours into maximal runs of consecutive hours
fn contiguous_runs(hours: &[usize]) -> Vec<Vec<usize>> {
    let mut runs: Vec<Vec<usize>> = Vec::new();
    for &hour in hours {
        match runs.last_mut() {
            Some(run) if run.last().map_or(false, |&h| h + 1 == hour) => run.push(hour),
            _ => runs.push(vec![hour]),
        }
    }
    runs
}
