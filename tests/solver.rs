mod common;

use srr_core::config::{IllPosedPolicy, Regularization, TikhonovOrder};
use srr_core::solver::lsmr::LsmrStop;
use srr_core::stack::StackGeometry;
use srr_core::{DeconvolutionMode, Stack};
use srr_core::{initial_estimate, ReconstructionConfig, Solver, SrrError, Volume};

use common::{cube_grid, init_logging, max_abs_diff, orthogonal_stacks, phantom_volume, relative_error};

fn tikhonov(order: TikhonovOrder, alpha: f64) -> ReconstructionConfig {
    ReconstructionConfig {
        regularization: Regularization::Tikhonov { order },
        alpha,
        ..Default::default()
    }
}

#[test]
fn tikhonov_residual_is_monotone() {
    init_logging();
    let truth = phantom_volume(12);
    let stacks = orthogonal_stacks(&truth, 2.0, 0.02);
    for order in [TikhonovOrder::Zeroth, TikhonovOrder::First] {
        let config = tikhonov(order, 0.03);
        let (_, report) = Solver::new(&config)
            .unwrap()
            .solve(&stacks, &Volume::zeros(truth.grid()), 25)
            .unwrap();
        assert!(report.residual_history.len() >= 2);
        for pair in report.residual_history.windows(2) {
            assert!(
                pair[1] <= pair[0] * (1.0 + 1e-9),
                "residual increased: {} -> {}",
                pair[0],
                pair[1]
            );
        }
    }
}

#[test]
fn vanishing_alpha_approaches_least_squares() {
    init_logging();
    let grid = cube_grid(6, 1.0);
    let truth = srr_core::simulate::phantom(&grid).unwrap();
    let stacks = orthogonal_stacks(&truth, 1.0, 0.0);
    let solve = |alpha: f64| {
        let config = ReconstructionConfig {
            tolerance: 1e-12,
            ..tikhonov(TikhonovOrder::First, alpha)
        };
        Solver::new(&config)
            .unwrap()
            .solve(&stacks, &Volume::zeros(&grid), 400)
            .unwrap()
    };
    let (unregularized, report) = solve(0.0);
    assert_eq!(report.prior_residual * report.alpha, 0.0);
    let (small, _) = solve(1e-9);
    let (large, _) = solve(1.0);
    let d_small = relative_error(&small, &unregularized);
    let d_large = relative_error(&large, &unregularized);
    assert!(d_small < 1e-3, "alpha = 1e-9 differs by {d_small}");
    assert!(d_large > d_small);
}

#[test]
fn huber_with_huge_threshold_is_first_order_tikhonov() {
    init_logging();
    let truth = phantom_volume(10);
    let stacks = orthogonal_stacks(&truth, 2.0, 0.0);
    // Reweighting is computed at the starting estimate; it must carry edges.
    let initial = initial_estimate(&stacks, &ReconstructionConfig::default(), Some(truth.grid()))
        .unwrap();

    let (tk1, _) = Solver::new(&tikhonov(TikhonovOrder::First, 0.5))
        .unwrap()
        .solve(&stacks, &initial, 8)
        .unwrap();
    let huber = |threshold: f64| {
        let config = ReconstructionConfig {
            regularization: Regularization::Huber {
                threshold,
                iterations: 1,
            },
            alpha: 0.5,
            ..Default::default()
        };
        Solver::new(&config)
            .unwrap()
            .solve(&stacks, &initial, 8)
            .unwrap()
            .0
    };
    assert!(max_abs_diff(&tk1, &huber(1e12)) < 1e-6);
    let robust = max_abs_diff(&tk1, &huber(0.05));
    assert!(robust > 1e-3, "small threshold matched TK1 within {robust}");
}

#[test]
fn huber_reweighting_runs_all_rounds() {
    init_logging();
    let truth = phantom_volume(10);
    let stacks = orthogonal_stacks(&truth, 2.0, 0.01);
    let config = ReconstructionConfig {
        regularization: Regularization::Huber {
            threshold: 0.05,
            iterations: 3,
        },
        ..Default::default()
    };
    let initial = initial_estimate(&stacks, &config, Some(truth.grid())).unwrap();
    let (volume, report) = Solver::new(&config)
        .unwrap()
        .solve(&stacks, &initial, 5)
        .unwrap();
    assert_eq!(report.solves, 3);
    assert_eq!(report.regularization, "HuberL2");
    assert!(relative_error(&volume, &truth) < relative_error(&initial, &truth));
}

#[test]
fn solve_is_deterministic_across_thread_settings() {
    init_logging();
    let truth = phantom_volume(10);
    let stacks = orthogonal_stacks(&truth, 2.0, 0.01);
    let parallel = ReconstructionConfig::default();
    let serial = ReconstructionConfig {
        parallel: false,
        ..Default::default()
    };
    let initial = Volume::zeros(truth.grid());
    let (a, _) = Solver::new(&parallel).unwrap().solve(&stacks, &initial, 6).unwrap();
    let (b, _) = Solver::new(&parallel).unwrap().solve(&stacks, &initial, 6).unwrap();
    let (c, _) = Solver::new(&serial).unwrap().solve(&stacks, &initial, 6).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, c);
}

#[test]
fn stacks_outside_the_grid_are_a_geometry_mismatch() {
    init_logging();
    let truth = phantom_volume(8);
    let stacks = orthogonal_stacks(&truth, 2.0, 0.0);
    let far = srr_core::Grid::isotropic([8, 8, 8], nalgebra::Vector3::repeat(100.0), 1.0).unwrap();
    let err = Solver::new(&ReconstructionConfig::default())
        .unwrap()
        .solve(&stacks, &Volume::zeros(&far), 5)
        .unwrap_err();
    assert!(matches!(err, SrrError::GeometryMismatch(_)));
}

#[test]
fn partial_coverage_fails_or_zero_fills() {
    init_logging();
    let truth = phantom_volume(8);
    // Only the axial stack: a grid twice as tall has uncovered planes.
    let stacks = vec![orthogonal_stacks(&truth, 2.0, 0.0).remove(0)];
    let tall = srr_core::Grid::isotropic([8, 8, 16], nalgebra::Vector3::zeros(), 1.0).unwrap();

    let err = Solver::new(&ReconstructionConfig::default())
        .unwrap()
        .solve(&stacks, &Volume::zeros(&tall), 5)
        .unwrap_err();
    match err {
        SrrError::IllPosedRegion { voxels, upper, .. } => {
            assert!(voxels > 0);
            assert_eq!(upper[2], 15);
        }
        other => panic!("expected an ill-posed region, got {other}"),
    }

    let config = ReconstructionConfig {
        ill_posed_policy: IllPosedPolicy::ZeroFill,
        ..Default::default()
    };
    let (volume, report) = Solver::new(&config)
        .unwrap()
        .solve(&stacks, &Volume::zeros(&tall), 5)
        .unwrap();
    assert!(report.zero_filled_voxels > 0);
    assert_eq!(volume.data()[[4, 4, 15]], 0.0);
    assert!(report.stop != LsmrStop::StartingPointExact);
}

#[test]
fn in_plane_deconvolution_handles_thin_slices() {
    init_logging();
    // 0.1 mm slices centred between voxel planes.
    let geometry = StackGeometry {
        origin: nalgebra::Vector3::new(0.0, 0.0, 0.5),
        spacing: nalgebra::Vector3::new(1.0, 1.0, 0.1),
        direction: nalgebra::Matrix3::identity(),
        slice_step: Some(1.0),
        psf: None,
    };
    let images = ndarray::Array3::from_shape_fn((8, 8, 8), |(k, i, j)| (1 + i + j + k) as f32);
    let stacks = vec![Stack::from_arrays("thin", &images, None, &geometry).unwrap()];
    let grid = cube_grid(8, 1.0);

    let err = Solver::new(&ReconstructionConfig::default())
        .unwrap()
        .solve(&stacks, &Volume::zeros(&grid), 5)
        .unwrap_err();
    assert!(matches!(err, SrrError::IllPosedRegion { .. }));

    let config = ReconstructionConfig {
        deconvolution: DeconvolutionMode::OnlyInPlane,
        ..Default::default()
    };
    let (volume, report) = Solver::new(&config)
        .unwrap()
        .solve(&stacks, &Volume::zeros(&grid), 20)
        .unwrap();
    assert_eq!(report.zero_filled_voxels, 0);
    assert!(report.data_residual > 0.0);
    assert!(volume.data().iter().any(|&v| v > 1.0));
}
