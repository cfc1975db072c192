//! Blocking collective message passing between Monte Carlo replicas.
//!
//! Every replica ("rank") runs its own Markov chain and only synchronizes at
//! collective calls: a [`broadcast`][Communicator::broadcast] from one rank to
//! all others, a [`gather`][Communicator::gather] from all ranks to one, and a
//! [`barrier`][Communicator::barrier]. Collectives must be entered by every
//! rank in the same order. A rank that never arrives blocks the others; a rank
//! that has gone away surfaces as [`CommError::Disconnected`].
//!
//! Two transports are provided: [`SerialComm`] for a single rank and
//! [`ThreadComm`], a full mesh of channels joining ranks that each run on their
//! own thread.

use crossbeam::channel;
use ndarray as nd;
use thiserror::Error;

/// Rank that performs reductions and owns the authoritative wavefunction.
pub const MASTER_RANK: usize = 0;

#[derive(Debug, Error)]
pub enum CommError {
    /// Returned when addressing a rank outside the group.
    #[error("rank {0} is out of range for a group of {1}")]
    BadRank(usize, usize),

    /// Returned when the peer at the other end of a channel has gone away.
    #[error("lost connection to rank {0}")]
    Disconnected(usize),

    /// Returned when a packet of the wrong kind arrives.
    #[error("expected a {expected} packet from rank {from}, got {got}")]
    UnexpectedPacket { from: usize, expected: &'static str, got: &'static str },

    /// Returned when a received tensor doesn't have the expected rank.
    #[error("received tensor has the wrong shape: {0}")]
    Shape(#[from] nd::ShapeError),
}
use CommError::*;
pub type CommResult<T> = Result<T, CommError>;

/// Unit of data exchanged between ranks.
#[allow(clippy::large_enum_variant)]
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    Scalar(f64),
    Scalars(Vec<f64>),
    Tensor(nd::ArrayD<f64>),
    Flag(bool),
    Sync,
}

impl Packet {
    fn kind(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::Scalars(_) => "scalars",
            Self::Tensor(_) => "tensor",
            Self::Flag(_) => "flag",
            Self::Sync => "sync",
        }
    }

    fn into_scalar(self, from: usize) -> CommResult<f64> {
        match self {
            Self::Scalar(x) => Ok(x),
            other => Err(UnexpectedPacket { from, expected: "scalar", got: other.kind() }),
        }
    }

    fn into_scalars(self, from: usize) -> CommResult<Vec<f64>> {
        match self {
            Self::Scalars(xs) => Ok(xs),
            other => Err(UnexpectedPacket { from, expected: "scalars", got: other.kind() }),
        }
    }

    fn into_tensor(self, from: usize) -> CommResult<nd::ArrayD<f64>> {
        match self {
            Self::Tensor(t) => Ok(t),
            other => Err(UnexpectedPacket { from, expected: "tensor", got: other.kind() }),
        }
    }

    fn into_flag(self, from: usize) -> CommResult<bool> {
        match self {
            Self::Flag(b) => Ok(b),
            other => Err(UnexpectedPacket { from, expected: "flag", got: other.kind() }),
        }
    }
}

/// Point-to-point transport between the ranks of a fixed group, with the
/// collectives used by the optimizer built on top.
pub trait Communicator {
    /// Rank of the caller, in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Send a packet to `dest`. Never blocks.
    fn send(&self, dest: usize, packet: Packet) -> CommResult<()>;

    /// Block until the next packet from `src` arrives.
    fn recv(&self, src: usize) -> CommResult<Packet>;

    fn is_master(&self) -> bool { self.rank() == MASTER_RANK }

    /// Distribute `packet` from `root` to every rank. The argument is ignored
    /// on every rank but `root`; all ranks return the root's packet.
    fn broadcast(&self, root: usize, packet: Packet) -> CommResult<Packet> {
        if root >= self.size() { return Err(BadRank(root, self.size())); }
        if self.rank() == root {
            for dest in (0..self.size()).filter(|r| *r != root) {
                self.send(dest, packet.clone())?;
            }
            Ok(packet)
        } else {
            self.recv(root)
        }
    }

    /// Collect one packet from every rank at `root`, ordered by rank. Returns
    /// `None` on every other rank.
    fn gather(&self, root: usize, packet: Packet) -> CommResult<Option<Vec<Packet>>> {
        if root >= self.size() { return Err(BadRank(root, self.size())); }
        if self.rank() == root {
            let mut packet = Some(packet);
            let mut all: Vec<Packet> = Vec::with_capacity(self.size());
            for src in 0..self.size() {
                if src == root {
                    all.extend(packet.take());
                } else {
                    all.push(self.recv(src)?);
                }
            }
            Ok(Some(all))
        } else {
            self.send(root, packet)?;
            Ok(None)
        }
    }

    /// Block until every rank has entered the barrier.
    fn barrier(&self) -> CommResult<()> {
        self.gather(MASTER_RANK, Packet::Sync)?;
        self.broadcast(MASTER_RANK, Packet::Sync)?;
        Ok(())
    }

    fn broadcast_scalar(&self, root: usize, x: f64) -> CommResult<f64> {
        self.broadcast(root, Packet::Scalar(x))?.into_scalar(root)
    }

    fn broadcast_scalars(&self, root: usize, xs: Vec<f64>) -> CommResult<Vec<f64>> {
        self.broadcast(root, Packet::Scalars(xs))?.into_scalars(root)
    }

    fn broadcast_flag(&self, root: usize, flag: bool) -> CommResult<bool> {
        self.broadcast(root, Packet::Flag(flag))?.into_flag(root)
    }

    /// Overwrite `tensor` on every rank with the root's copy.
    fn broadcast_tensor<D>(&self, root: usize, tensor: &mut nd::Array<f64, D>)
        -> CommResult<()>
    where D: nd::Dimension
    {
        if self.rank() == root {
            self.broadcast(root, Packet::Tensor(tensor.clone().into_dyn()))?;
        } else {
            let recvd = self.broadcast(root, Packet::Sync)?.into_tensor(root)?;
            *tensor = recvd.into_dimensionality::<D>()?;
        }
        Ok(())
    }

    fn gather_scalar(&self, root: usize, x: f64) -> CommResult<Option<Vec<f64>>> {
        self.gather(root, Packet::Scalar(x))?
            .map(|all| {
                all.into_iter().enumerate()
                    .map(|(src, p)| p.into_scalar(src))
                    .collect::<CommResult<Vec<f64>>>()
            })
            .transpose()
    }

    fn gather_scalars(&self, root: usize, xs: Vec<f64>) -> CommResult<Option<Vec<Vec<f64>>>> {
        self.gather(root, Packet::Scalars(xs))?
            .map(|all| {
                all.into_iter().enumerate()
                    .map(|(src, p)| p.into_scalars(src))
                    .collect::<CommResult<Vec<Vec<f64>>>>()
            })
            .transpose()
    }

    fn gather_tensor<D>(&self, root: usize, tensor: nd::Array<f64, D>)
        -> CommResult<Option<Vec<nd::Array<f64, D>>>>
    where D: nd::Dimension
    {
        self.gather(root, Packet::Tensor(tensor.into_dyn()))?
            .map(|all| {
                all.into_iter().enumerate()
                    .map(|(src, p)| {
                        Ok(p.into_tensor(src)?.into_dimensionality::<D>()?)
                    })
                    .collect::<CommResult<Vec<nd::Array<f64, D>>>>()
            })
            .transpose()
    }
}

/// A group of one.
#[derive(Clone, Debug)]
pub struct SerialComm {
    loopback_in: channel::Sender<Packet>,
    loopback_out: channel::Receiver<Packet>,
}

impl Default for SerialComm {
    fn default() -> Self { Self::new() }
}

impl SerialComm {
    pub fn new() -> Self {
        let (loopback_in, loopback_out) = channel::unbounded();
        Self { loopback_in, loopback_out }
    }
}

impl Communicator for SerialComm {
    fn rank(&self) -> usize { 0 }

    fn size(&self) -> usize { 1 }

    fn send(&self, dest: usize, packet: Packet) -> CommResult<()> {
        if dest != 0 { return Err(BadRank(dest, 1)); }
        self.loopback_in.send(packet).map_err(|_| Disconnected(0))
    }

    fn recv(&self, src: usize) -> CommResult<Packet> {
        if src != 0 { return Err(BadRank(src, 1)); }
        // nobody else can ever fill an empty loopback
        self.loopback_out.try_recv().map_err(|_| Disconnected(0))
    }
}

/// One rank of an in-process group, joined to every other rank (and itself)
/// by a dedicated unbounded channel.
#[derive(Debug)]
pub struct ThreadComm {
    rank: usize,
    // indexed by destination rank
    senders: Vec<channel::Sender<Packet>>,
    // indexed by source rank
    receivers: Vec<channel::Receiver<Packet>>,
}

impl ThreadComm {
    /// Create a group of `n` ranks. Element `k` of the returned vector is rank
    /// `k`; each is meant to be moved onto its own thread.
    pub fn group(n: usize) -> Vec<Self> {
        let mut senders: Vec<Vec<channel::Sender<Packet>>>
            = (0..n).map(|_| Vec::with_capacity(n)).collect();
        let mut receivers: Vec<Vec<channel::Receiver<Packet>>>
            = (0..n).map(|_| Vec::with_capacity(n)).collect();
        for src in 0..n {
            for dest in 0..n {
                let (tx, rx) = channel::unbounded();
                senders[src].push(tx);
                receivers[dest].push(rx);
            }
        }
        senders.into_iter().zip(receivers).enumerate()
            .map(|(rank, (senders, receivers))| Self { rank, senders, receivers })
            .collect()
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize { self.rank }

    fn size(&self) -> usize { self.senders.len() }

    fn send(&self, dest: usize, packet: Packet) -> CommResult<()> {
        self.senders.get(dest)
            .ok_or(BadRank(dest, self.size()))?
            .send(packet)
            .map_err(|_| Disconnected(dest))
    }

    fn recv(&self, src: usize) -> CommResult<Packet> {
        self.receivers.get(src)
            .ok_or(BadRank(src, self.size()))?
            .recv()
            .map_err(|_| Disconnected(src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_group<F, T>(n: usize, f: F) -> Vec<T>
    where
        F: Fn(ThreadComm) -> T + Sync,
        T: Send,
    {
        thread::scope(|s| {
            let handles: Vec<_>
                = ThreadComm::group(n).into_iter()
                .map(|comm| s.spawn(|| f(comm)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn broadcast_reaches_every_rank() {
        let got = run_group(4, |comm| {
            let x = if comm.is_master() { 2.5 } else { -1.0 };
            comm.broadcast_scalar(MASTER_RANK, x).unwrap()
        });
        assert_eq!(got, vec![2.5; 4]);
    }

    #[test]
    fn gather_orders_by_rank() {
        let got = run_group(3, |comm| {
            comm.gather_scalar(1, comm.rank() as f64 * 10.0).unwrap()
        });
        assert_eq!(got[0], None);
        assert_eq!(got[1], Some(vec![0.0, 10.0, 20.0]));
        assert_eq!(got[2], None);
    }

    #[test]
    fn tensors_keep_their_shape() {
        let got = run_group(2, |comm| {
            let mut t = if comm.is_master() {
                nd::Array2::from_shape_fn((2, 3), |(i, j)| (3 * i + j) as f64)
            } else {
                nd::Array2::zeros((1, 1))
            };
            comm.broadcast_tensor(MASTER_RANK, &mut t).unwrap();
            comm.barrier().unwrap();
            t
        });
        assert_eq!(got[0], got[1]);
        assert_eq!(got[1].dim(), (2, 3));
    }

    #[test]
    fn mismatched_packets_are_errors() {
        let got = run_group(2, |comm| {
            if comm.is_master() {
                comm.broadcast(MASTER_RANK, Packet::Flag(true)).map(|_| ())
            } else {
                comm.broadcast_scalar(MASTER_RANK, 0.0).map(|_| ())
            }
        });
        assert!(got[0].is_ok());
        assert!(matches!(
            got[1],
            Err(CommError::UnexpectedPacket { from: 0, expected: "scalar", got: "flag" })
        ));
    }

    #[test]
    fn serial_collectives_are_trivial() {
        let comm = SerialComm::new();
        assert_eq!(comm.broadcast_scalar(MASTER_RANK, 1.5).unwrap(), 1.5);
        assert_eq!(comm.gather_scalar(MASTER_RANK, 3.0).unwrap(), Some(vec![3.0]));
        comm.barrier().unwrap();
        assert!(matches!(comm.recv(0), Err(CommError::Disconnected(0))));
        assert!(matches!(comm.send(1, Packet::Sync), Err(CommError::BadRank(1, 1))));
    }

    #[test]
    fn dropped_peer_disconnects() {
        let mut group = ThreadComm::group(2);
        let worker = group.pop().unwrap();
        drop(worker);
        let master = group.pop().unwrap();
        assert!(matches!(master.recv(1), Err(CommError::Disconnected(1))));
    }
}
