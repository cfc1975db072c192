//! Sample statistics and cross-rank reductions.

use ndarray as nd;
use statrs::statistics::Statistics;
use crate::{
    comm::{ CommResult, Communicator, MASTER_RANK },
    tps::SplitIndexTPS,
};

/// Arithmetic mean; NaN for no data.
pub fn mean(xs: &[f64]) -> f64 { xs.iter().mean() }

/// Population variance; NaN for no data.
pub fn variance(xs: &[f64]) -> f64 { xs.iter().population_variance() }

/// Standard error of the mean of `xs`, taken to be independent estimates of
/// the same quantity: `sqrt(var / (K - 1))` with the population variance
/// `var`. Zero for fewer than two estimates.
pub fn standard_error(xs: &[f64]) -> f64 {
    let k = xs.len();
    if k < 2 { return 0.0; }
    (variance(xs) / (k - 1) as f64).sqrt()
}

/// Reduce every rank's mean energy to the grand mean and its standard error,
/// available on every rank.
pub fn gather_energy_statistics<C>(comm: &C, local_mean: f64) -> CommResult<(f64, f64)>
where C: Communicator
{
    let stats: Vec<f64>
        = match comm.gather_scalar(MASTER_RANK, local_mean)? {
            Some(all) => vec![mean(&all), standard_error(&all)],
            None => Vec::new(),
        };
    let stats = comm.broadcast_scalars(MASTER_RANK, stats)?;
    Ok((stats.first().copied().unwrap_or(f64::NAN), stats.get(1).copied().unwrap_or(f64::NAN)))
}

/// Element-wise sum of one tensor from every rank, on the master only.
pub fn sum_tensor<C, D>(comm: &C, tensor: nd::Array<f64, D>)
    -> CommResult<Option<nd::Array<f64, D>>>
where
    C: Communicator,
    D: nd::Dimension,
{
    let all = comm.gather_tensor(MASTER_RANK, tensor)?;
    Ok(all.and_then(|all| {
        let mut iter = all.into_iter();
        let first = iter.next()?;
        Some(iter.fold(first, |acc, t| acc + t))
    }))
}

/// Equal-weight mean of one tensor over all ranks, on the master only.
pub fn mean_tensor<C, D>(comm: &C, tensor: nd::Array<f64, D>)
    -> CommResult<Option<nd::Array<f64, D>>>
where
    C: Communicator,
    D: nd::Dimension,
{
    let size = comm.size() as f64;
    Ok(sum_tensor(comm, tensor)?.map(|t| t / size))
}

fn reduce_sitps<C, F>(comm: &C, mut sitps: SplitIndexTPS, mut reduce: F)
    -> CommResult<Option<SplitIndexTPS>>
where
    C: Communicator,
    F: FnMut(&C, nd::Array4<f64>) -> CommResult<Option<nd::Array4<f64>>>,
{
    for t in sitps.iter_mut() {
        if let Some(reduced) = reduce(comm, std::mem::take(t))? { *t = reduced; }
    }
    Ok(comm.is_master().then_some(sitps))
}

/// Sum of a tensor set over all ranks, one tensor at a time. The result exists
/// on the master only; the other ranks' inputs are consumed.
pub fn sum_sitps<C>(comm: &C, sitps: SplitIndexTPS) -> CommResult<Option<SplitIndexTPS>>
where C: Communicator
{
    reduce_sitps(comm, sitps, sum_tensor)
}

/// Equal-weight mean of a tensor set over all ranks, one tensor at a time. The
/// result exists on the master only; the other ranks' inputs are consumed.
pub fn mean_sitps<C>(comm: &C, sitps: SplitIndexTPS) -> CommResult<Option<SplitIndexTPS>>
where C: Communicator
{
    reduce_sitps(comm, sitps, mean_tensor)
}

/// Overwrite every rank's tensor set with the master's.
pub fn broadcast_sitps<C>(comm: &C, sitps: &mut SplitIndexTPS) -> CommResult<()>
where C: Communicator
{
    sitps.iter_mut().try_for_each(|t| comm.broadcast_tensor(MASTER_RANK, t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use approx::assert_relative_eq;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::comm::ThreadComm;

    #[test]
    fn pooled_statistics() {
        let xs = [1.0, 2.0, 4.0, 5.0];
        assert_relative_eq!(mean(&xs), 3.0);
        assert_relative_eq!(variance(&xs), 2.5);
        assert_relative_eq!(standard_error(&xs), (2.5_f64 / 3.0).sqrt());
        assert_eq!(standard_error(&[7.0]), 0.0);
    }

    #[test]
    fn energy_statistics_are_shared() {
        let locals = [-1.0, -1.2, -0.9];
        let got: Vec<(f64, f64)> = thread::scope(|s| {
            let handles: Vec<_>
                = ThreadComm::group(3).into_iter()
                .map(|comm| s.spawn(move || {
                    gather_energy_statistics(&comm, locals[comm.rank()]).unwrap()
                }))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let m = (-1.0 - 1.2 - 0.9) / 3.0;
        let var = locals.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / 3.0;
        for (e, err) in got.iter() {
            assert_relative_eq!(*e, m, epsilon = 1e-14);
            assert_relative_eq!(*err, (var / 2.0).sqrt(), epsilon = 1e-14);
        }
        assert!(got.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn sitps_mean_lives_on_master() {
        let mut rng = StdRng::seed_from_u64(51);
        let base = SplitIndexTPS::random(2, 2, 2, 2, &mut rng).unwrap();
        let got: Vec<Option<SplitIndexTPS>> = thread::scope(|s| {
            let handles: Vec<_>
                = ThreadComm::group(2).into_iter()
                .map(|comm| {
                    let mut local = base.clone();
                    local.scale(comm.rank() as f64 + 1.0);
                    s.spawn(move || mean_sitps(&comm, local).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(got[1].is_none());
        let mean = got[0].as_ref().unwrap();
        let mut expected = base.clone();
        expected.scale(1.5);
        for (a, b) in mean.iter().zip(expected.iter()) {
            a.iter().zip(b.iter()).for_each(|(x, y)| { assert_relative_eq!(x, y, epsilon = 1e-14); });
        }
    }

    #[test]
    fn sitps_broadcast_overwrites_workers() {
        let mut rng = StdRng::seed_from_u64(52);
        let master = SplitIndexTPS::random(2, 3, 2, 2, &mut rng).unwrap();
        let worker = SplitIndexTPS::random(2, 3, 2, 2, &mut rng).unwrap();
        let got: Vec<SplitIndexTPS> = thread::scope(|s| {
            let handles: Vec<_>
                = ThreadComm::group(3).into_iter()
                .map(|comm| {
                    let mut local = if comm.is_master() { master.clone() } else { worker.clone() };
                    s.spawn(move || {
                        broadcast_sitps(&comm, &mut local).unwrap();
                        local
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(got.iter().all(|sitps| *sitps == master));
    }
}
