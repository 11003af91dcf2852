use clap::Parser;
use nalgebra::{DMatrix, Vector3};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use qmc_wfopt::{
    read_cost_config, CostConfig, CostFunctionEvaluator, HarmonicHamiltonian, HarmonicModel,
    InMemorySampleStore, LocalReducer, ParticleConfiguration, SampleStore, TrialWavefunction,
    Walker,
    WalkerCrowd,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.yml")]
    config: String,

    /// Number of walkers in the sampling crowd
    #[arg(short, long, default_value_t = 32)]
    walkers: usize,

    /// Metropolis blocks (one archived sample per walker per block)
    #[arg(short, long, default_value_t = 16)]
    blocks: usize,

    /// Metropolis steps per block
    #[arg(short, long, default_value_t = 50)]
    steps: usize,

    /// Gradient-descent iterations
    #[arg(short, long, default_value_t = 20)]
    iterations: usize,

    /// Gradient-descent step size
    #[arg(short = 'r', long, default_value_t = 0.05)]
    learning_rate: f64,
}

fn log_psi<W: TrialWavefunction>(psi: &W, r: &[Vector3<f64>]) -> f64 {
    let n = r.len();
    let mut fixed_grad = vec![Vector3::zeros(); n];
    let mut fixed_lap = vec![0.0; n];
    let (log_fixed, log_free) = psi.evaluate_delta_log_setup(r, &mut fixed_grad, &mut fixed_lap);
    log_fixed + log_free
}

/// Sample |Ψ|² with a crowd of Metropolis walkers and archive one
/// configuration per walker at the end of every block.
fn sample_configurations(
    psi: &HarmonicModel,
    args: &Args,
) -> InMemorySampleStore {
    let mut rng = rand::thread_rng();
    let step_dist = Normal::new(0.0, 0.4).unwrap();

    let mut pool: Vec<(Walker, ParticleConfiguration, HarmonicModel, HarmonicHamiltonian)> = (0
        ..args.walkers)
        .map(|_| {
            let r = psi.initialize(&mut rng);
            (
                Walker::new(r),
                ParticleConfiguration::new(psi.num_particles()),
                psi.clone(),
                HarmonicHamiltonian::new(1.0),
            )
        })
        .collect();

    let mut crowd = WalkerCrowd::new();
    crowd.reserve(args.walkers);
    for (walker, cfg, model, ham) in pool.iter_mut() {
        crowd.add_walker(walker, cfg, model, ham);
    }

    let mut store = InMemorySampleStore::new();
    for block in 0..args.blocks {
        crowd.start_block(args.steps);
        crowd.clear_results();
        crowd.load_walkers();

        for iw in 0..crowd.size() {
            let mut log_now = log_psi(psi, &crowd.configurations_mut()[iw].r);
            for _ in 0..args.steps {
                let mut proposed = crowd.configurations_mut()[iw].r.clone();
                for ri in proposed.iter_mut() {
                    ri.x += step_dist.sample(&mut rng);
                    ri.y += step_dist.sample(&mut rng);
                    ri.z += step_dist.sample(&mut rng);
                }
                let log_new = log_psi(psi, &proposed);
                if rng.gen::<f64>() < (2.0 * (log_new - log_now)).exp() {
                    crowd.configurations_mut()[iw].r.copy_from_slice(&proposed);
                    log_now = log_new;
                    crowd.inc_accept();
                } else {
                    crowd.inc_reject();
                }
            }
            store.append(crowd.configurations_mut()[iw].r.clone());
        }

        if block == 0 {
            let total = (crowd.accepted() + crowd.rejected()) as f64;
            println!(
                "  block 0 acceptance ratio: {:.3}",
                crowd.accepted() as f64 / total
            );
        }
    }
    store
}

fn main() {
    let args = Args::parse();

    let config = match read_cost_config(&args.config) {
        Ok(c) => c,
        Err(e) => {
            println!("Could not read {} ({}); using default cost settings", args.config, e);
            CostConfig::default()
        }
    };
    println!("Cost configuration: {:?}", config);

    // Start away from the exact ground state (omega = 1 sits at theta1 = 0.5).
    let num_particles = 2;
    let mut params = vec![0.35, 0.0];
    let psi = HarmonicModel::new(num_particles, 0.0, params.clone());
    let ham = HarmonicHamiltonian::new(1.0);

    println!("Sampling {} walkers x {} blocks...", args.walkers, args.blocks);
    let store = sample_configurations(&psi, &args);
    println!("Archived {} configurations", store.num_samples());

    let mut evaluator =
        CostFunctionEvaluator::new(config, store, LocalReducer, psi, ham).with_verbose(true);
    evaluator.prepare_sample_buffers();
    evaluator.evaluate_reference_configurations();
    println!("Reference energy: {:.6}", evaluator.target_energy());

    let num_params = evaluator.num_params();
    let mut gradient = vec![0.0; num_params];
    for it in 0..args.iterations {
        evaluator.compute_gradient(&mut gradient, &params, 0.0);
        if !evaluator.is_valid() {
            println!(
                "Stopping at iteration {}: effective samples {:.1} of {}",
                it,
                evaluator.effective_samples(),
                evaluator.num_samples_global()
            );
            break;
        }
        for (p, g) in params.iter_mut().zip(gradient.iter()) {
            *p -= args.learning_rate * g;
        }
        evaluator.reset_parameters(&params);
        let cost = evaluator.cost();
        println!(
            "iter {:3}  cost = {:.6}  params = {:?}  eff. samples = {:.1}",
            it,
            cost,
            params,
            evaluator.effective_samples()
        );
    }

    // Linear-method matrices at the optimized parameters.
    evaluator.compute_gradient(&mut gradient, &params, 0.0);
    let mut left = DMatrix::zeros(num_params + 1, num_params + 1);
    let mut right = DMatrix::zeros(num_params + 1, num_params + 1);
    let scale = evaluator.build_generalized_eigenproblem(&mut left, &mut right);
    println!("Eigenproblem scale: {:.6}", scale);
    println!("Left(0,0)  = {:.6} (energy/variance corner)", left[(0, 0)]);
    println!("Right(0,0) = {:.6}", right[(0, 0)]);

    evaluator.finish_optimization(&params);
    println!("Final parameters: {:?}", params);
    println!("Exact ground state for omega = 1: theta = [0.5, 0.0], E = 3.0");
}
