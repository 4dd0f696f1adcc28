use std::thread;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::unbounded;

use rust_jigsaw::bundle::{BundleAdjust, BundleOutcome, BundleSettings, BundleSolutionInfo, BundleStatus};
use rust_jigsaw::io::{load_problem, write_solution};
use rust_jigsaw::synthetic::{SyntheticConfig, SyntheticNetwork};

fn usage() -> ! {
    eprintln!("usage: rust-jigsaw <problem.yaml | --synthetic> [solution.json]");
    std::process::exit(2);
}

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let input = args.next().unwrap_or_else(|| usage());
    let output = args.next();

    let (settings, net, images, network_file) = if input == "--synthetic" {
        println!("Generating a synthetic network with perturbed pointing");
        let scene = SyntheticNetwork::generate(&SyntheticConfig {
            measure_noise: 0.25,
            ..Default::default()
        })
        .perturb_pointing(2e-4, 7)
        .perturb_points(0.05, 8);
        let settings = BundleSettings {
            error_propagation: true,
            ..Default::default()
        };
        let (net, images) = scene.into_parts();
        (settings, net, images, None)
    } else {
        println!("Loading bundle problem from: {}", input);
        let problem = load_problem(&input)?;
        let images = problem.bundle_images();
        (problem.settings, problem.network, images, Some(input.clone()))
    };
    println!(
        "Loaded {} points, {} measures, {} images",
        net.num_points(),
        net.num_measures(),
        images.len()
    );

    let (sender, receiver) = unbounded();
    let printer = thread::spawn(move || {
        for status in receiver {
            match status {
                BundleStatus::State(state) => println!("[state] {}", state),
                BundleStatus::Iteration(it) => println!(
                    "[iteration {:>3}] sigma0 {:.6}  vtpv {:.6}  dof {}  rejected {}  rms {:.4} px",
                    it.iteration,
                    it.sigma0,
                    it.vtpv,
                    it.degrees_of_freedom,
                    it.rejected_measures,
                    it.rms_total
                ),
                BundleStatus::TierEntered(tier) => println!(
                    "[tier {}] {} at quantile {:.3}, constant {:.6}",
                    tier.tier,
                    tier.model.name(),
                    tier.quantile,
                    tier.tweaking_constant
                ),
                BundleStatus::Message(message) => println!("{}", message),
            }
        }
    });

    let settings_copy = settings.clone();
    let mut bundle = BundleAdjust::new(settings, net, images)
        .context("Failed to set up bundle adjustment")?
        .with_progress(sender);
    let outcome = bundle.solve().context("Bundle adjustment failed")?;
    let (net, images, results) = bundle.into_parts();
    printer
        .join()
        .map_err(|_| anyhow!("progress printer panicked"))?;

    match outcome {
        BundleOutcome::Converged => println!("Bundle converged"),
        BundleOutcome::DidNotConverge => {
            println!("WARNING: bundle did not converge; reporting the last iteration")
        }
        BundleOutcome::Aborted => println!("Bundle aborted"),
    }

    let solution = BundleSolutionInfo::new(settings_copy, results, &images, net, network_file);
    println!("{}", solution.summary());
    println!("{}", solution.image_report());

    if let Some(path) = output {
        write_solution(&path, &solution)?;
        println!("Solution written to {}", path);
    }
    Ok(())
}
