//! Fault generation on the PE array.
//!
//! Three generators share the engine's grid and derived clock depth:
//! a random permanent stuck-at fault (replicated across every cycle of the
//! tile pass), a burst of independent transient faults, and a permanent
//! fault at a caller-chosen location for directed experiments.
//!
//! Every generator takes an explicit random source so campaigns are
//! reproducible from a seed, and assigns monotonically increasing ids
//! before any propagation or replication so later collapses can trace
//! merged records back to the faults that produced them.

use crate::engine::PeArray;
use crate::error::{DataflowError, Result};
use crate::table::{FaultColumns, FaultMeta, FaultMode, FaultOrigin, PortTag};
use rand::Rng;

impl PeArray {
    fn require_clk(&self) -> Result<usize> {
        self.n_clk.ok_or(DataflowError::ClockDepthUnset)
    }

    /// Draw one candidate permanent fault site without installing it.
    pub fn sample_fault_site<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        n_bit: u16,
        ports: Option<&[PortTag]>,
    ) -> ((usize, usize), PortTag, u16) {
        let ports = ports.unwrap_or(&PortTag::ALL);
        let loc = (rng.gen_range(0..self.n_y), rng.gen_range(0..self.n_x));
        let port = ports[rng.gen_range(0..ports.len())];
        let bit = rng.gen_range(0..n_bit);
        (loc, port, bit)
    }

    /// Generate one random permanent stuck-at fault and replicate it across
    /// all clock cycles of the tile pass. With `propagate`, the fault first
    /// spreads to the PEs its interconnect reaches (requires a MAC wiring),
    /// and each propagated location gets its own full clock run.
    pub fn gen_stuck_at_faults<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        n_bit: u16,
        mode: FaultMode,
        ports: Option<&[PortTag]>,
        propagate: bool,
    ) -> Result<usize> {
        let (loc, port, bit) = self.sample_fault_site(rng, n_bit, ports);
        self.inject_permanent_fault(loc, port, bit, mode, propagate)
    }

    /// Install a permanent fault at a caller-chosen location, replicated
    /// across all clock cycles like the random generator.
    pub fn inject_permanent_fault(
        &mut self,
        loc: (usize, usize),
        port: PortTag,
        bit: u16,
        mode: FaultMode,
        propagate: bool,
    ) -> Result<usize> {
        let n_clk = self.require_clk()?;
        if loc.0 >= self.n_y || loc.1 >= self.n_x {
            return Err(DataflowError::config(format!(
                "fault location ({}, {}) outside the {}x{} grid",
                loc.0, loc.1, self.n_y, self.n_x
            )));
        }
        let loc = (loc.0 as i64, loc.1 as i64);
        let locs: Vec<(i64, i64)> = if propagate {
            let wiring = self.wiring.as_ref().ok_or_else(|| {
                DataflowError::config("fault propagation requires a MAC wiring")
            })?;
            wiring.propagated_locations(port, loc, (self.n_y, self.n_x))
        } else {
            vec![loc]
        };

        let mut table = FaultColumns::empty(3);
        let mut id = 0u64;
        for clk in 0..n_clk {
            for &(y, x) in &locs {
                table.push(
                    &[y, x, clk as i64],
                    FaultMeta::single(port, mode.clone(), bit, id),
                );
                id += 1;
            }
        }
        tracing::debug!(
            ?loc,
            port = %port,
            bit,
            faults = table.len(),
            "generated permanent fault run"
        );

        self.fault_origin = FaultOrigin::Uniform;
        self.translate_neighbor_io(&mut table)?;
        let count = table.len();
        self.fault_table = table;
        Ok(count)
    }

    /// Generate `fault_num` independent single-cycle transient faults, each
    /// with its own location, cycle, port and bit.
    pub fn gen_transient_faults<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        n_bit: u16,
        fault_num: usize,
        mode: FaultMode,
        ports: Option<&[PortTag]>,
    ) -> Result<usize> {
        let n_clk = self.require_clk()?;
        let ports = ports.unwrap_or(&PortTag::ALL);

        let mut table = FaultColumns::empty(3);
        for id in 0..fault_num {
            let coord = [
                rng.gen_range(0..self.n_y) as i64,
                rng.gen_range(0..self.n_x) as i64,
                rng.gen_range(0..n_clk) as i64,
            ];
            let port = ports[rng.gen_range(0..ports.len())];
            let bit = rng.gen_range(0..n_bit);
            table.push(&coord, FaultMeta::single(port, mode.clone(), bit, id as u64));
        }
        tracing::debug!(faults = table.len(), "generated transient fault burst");

        self.fault_origin = FaultOrigin::Mixed;
        self.translate_neighbor_io(&mut table)?;
        let count = table.len();
        self.fault_table = table;
        Ok(count)
    }
}
