use std::{ path::Path, thread };
use rand::{ SeedableRng, rngs::StdRng };
use peps_net::{
    comm::ThreadComm,
    params::{ MCSweepScheme, WavefunctionUpdateScheme },
    sr::ConjugateGradientParams,
    tensor::TruncatePara,
    MCMeasurementExecutor,
    MCMeasurementPara,
    MCParams,
    SerialComm,
    SpinOneHalfHeisenbergSquare,
    SplitIndexTPS,
    VMCOptimizePara,
    VMCPEPSExecutor,
};

/// Ground state energy of the 2x2 open-boundary Heisenberg model, i.e. a
/// four-site ring.
const E0_2X2: f64 = -2.0;

fn mc_params(dir: &Path, samples: usize, seed: u64) -> MCParams {
    MCParams {
        trunc_para: TruncatePara::new(3, 9, 0.0),
        mc_samples: samples,
        mc_warm_up_sweeps: 20,
        mc_sweeps_between_sample: 1,
        mc_sweep_scheme: MCSweepScheme::SequentiallyNNSiteFlip,
        occupancy: vec![2, 2],
        init_config: None,
        wavefunction_path: dir.join("tps"),
        seed: Some(seed),
    }
}

fn optimize_params(dir: &Path, iterations: usize, samples: usize, seed: u64)
    -> VMCOptimizePara
{
    VMCOptimizePara {
        mc: mc_params(dir, samples, seed),
        step_lens: vec![0.2; iterations],
        update_scheme: WavefunctionUpdateScheme::StochasticReconfiguration,
        cg_params: ConjugateGradientParams::default(),
        energy_path: dir.join("energy"),
    }
}

fn initial_state(bond_dim: usize) -> SplitIndexTPS {
    let mut rng = StdRng::seed_from_u64(10086);
    SplitIndexTPS::random(2, 2, 2, bond_dim, &mut rng).unwrap()
}

/// Run the optimization on `ranks` threads, returning each rank's energy
/// trajectory and final wavefunction.
fn run_threaded(params: &VMCOptimizePara, sitps: &SplitIndexTPS, ranks: usize)
    -> Vec<(Vec<f64>, SplitIndexTPS)>
{
    thread::scope(|s| {
        let handles: Vec<_>
            = ThreadComm::group(ranks).into_iter()
            .map(|comm| {
                s.spawn(move || {
                    let mut exe = VMCPEPSExecutor::new(
                        params.clone(),
                        sitps.clone(),
                        SpinOneHalfHeisenbergSquare::new(),
                        comm,
                    ).unwrap();
                    exe.execute().unwrap();
                    (exe.energy_trajectory().to_vec(), exe.sitps().clone())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn sr_converges_to_2x2_ground_state() {
    let dir = tempfile::tempdir().unwrap();
    let params = optimize_params(dir.path(), 40, 200, 2024);
    let results = run_threaded(&params, &initial_state(3), 2);

    let (energies, sitps) = &results[0];
    assert_eq!(energies.len(), 40);
    let tail: f64 = energies[35..].iter().sum::<f64>() / 5.0;
    assert!(
        (tail - E0_2X2).abs() < 0.05 * E0_2X2.abs(),
        "final energy {tail} too far from {E0_2X2}",
    );
    assert!(tail < energies[0]);

    // every rank ends with the same wavefunction and the same statistics
    for (other_energies, other_sitps) in results.iter().skip(1) {
        assert_eq!(other_energies, energies);
        assert_eq!(other_sitps, sitps);
    }
}

#[test]
fn fixed_seed_is_reproducible() {
    let run = || {
        let dir = tempfile::tempdir().unwrap();
        let params = optimize_params(dir.path(), 3, 20, 99);
        let mut exe = VMCPEPSExecutor::new(
            params,
            initial_state(2),
            SpinOneHalfHeisenbergSquare::new(),
            SerialComm::new(),
        ).unwrap();
        exe.execute().unwrap();
        (
            exe.energy_trajectory().to_vec(),
            exe.grad_norms().to_vec(),
            exe.energy_samples().to_vec(),
            exe.sitps().clone(),
        )
    };
    assert_eq!(run(), run());
}

#[test]
fn measurement_resumes_from_optimized_state() {
    let dir = tempfile::tempdir().unwrap();
    let params = optimize_params(dir.path(), 5, 50, 7);
    let mut exe = VMCPEPSExecutor::new(
        params,
        initial_state(2),
        SpinOneHalfHeisenbergSquare::new(),
        SerialComm::new(),
    ).unwrap();
    exe.execute().unwrap();

    let measure_params = MCMeasurementPara {
        mc: mc_params(dir.path(), 100, 8),
        output_path: dir.path().join("measure"),
    };
    let mut measure = MCMeasurementExecutor::load(
        measure_params, SpinOneHalfHeisenbergSquare::new(), SerialComm::new(),
    ).unwrap();
    measure.execute().unwrap();
    let results = measure.results();
    assert_eq!(results.bond_energies.len(), 4);
    assert!(results.energy.value.is_finite());
    let bond_sum: f64 = results.bond_energies.iter().map(|e| e.value).sum();
    assert!((results.energy.value - bond_sum).abs() < 1e-10);
    assert!(results.one_point_functions.iter().all(|s| s.value.abs() <= 0.5 + 1e-12));
    assert!(dir.path().join("measure/bond_energys").exists());
}
