use layernet::layers::{MaxPool, Relu, Softmax};
use layernet::{Device, Error, Layer, Shape, Tensor};

fn pushed(dims: &[usize], data: Vec<f32>) -> Tensor {
    let mut t = Tensor::from_vec(&Device::Cpu, dims, data).unwrap();
    t.push().unwrap();
    t
}

#[test]
fn test_relu_masks_forward_and_backward() {
    let shape = Shape::new(&[3]).unwrap();
    let mut relu = Relu::new(&Device::Cpu, shape).unwrap();
    let x = pushed(&[3, 2], vec![-1.0, 0.0, 2.0, 3.0, -0.5, 0.25]);
    let y = relu.forward(&x, true).unwrap().to_vec().unwrap();
    assert_eq!(y, vec![0.0, 0.0, 2.0, 3.0, 0.0, 0.25]);

    let upstream = pushed(&[3, 2], vec![1.0; 6]);
    let dx = relu.backward(&x, &upstream).unwrap().to_vec().unwrap();
    assert_eq!(dx, vec![0.0, 0.0, 1.0, 1.0, 0.0, 1.0]);
}

#[test]
fn test_max_pool_halves_each_plane() {
    let shape = Shape::new(&[4, 2, 1]).unwrap();
    let mut pool = MaxPool::new(&Device::Cpu, shape).unwrap();
    assert_eq!(pool.output_shape().dims(), &[2, 1, 1]);

    // Two rows of four: windows are columns 0-1 and 2-3.
    let x = pushed(&[4, 2, 1, 1], vec![1.0, 5.0, 2.0, 0.0, 3.0, 4.0, 7.0, 6.0]);
    assert_eq!(pool.forward(&x, true).unwrap().to_vec().unwrap(), vec![5.0, 7.0]);

    let upstream = pushed(&[2, 1, 1, 1], vec![10.0, 20.0]);
    let dx = pool.backward(&x, &upstream).unwrap().to_vec().unwrap();
    assert_eq!(dx, vec![0.0, 10.0, 0.0, 0.0, 0.0, 0.0, 20.0, 0.0]);
}

#[test]
fn test_softmax_columns_are_distributions() {
    let shape = Shape::new(&[4]).unwrap();
    let mut softmax = Softmax::new(&Device::Cpu, shape).unwrap();
    assert!(softmax.is_terminal());
    let x = pushed(&[4, 2], vec![1.0, 2.0, 3.0, 4.0, 1000.0, 0.0, -1000.0, 0.0]);
    let p = softmax.forward(&x, false).unwrap().to_vec().unwrap();
    for column in p.chunks(4) {
        assert!((column.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(column.iter().all(|v| v.is_finite()));
    }
    assert!(p[3] > p[2] && p[2] > p[1]);
    assert!((p[4] - 1.0).abs() < 1e-6);

    let bad = pushed(&[2], vec![1.0, 4.0]);
    assert!(softmax.backward(&x, &bad).is_err());
}

#[test]
fn test_partial_samples_are_rejected() {
    let shape = Shape::new(&[3]).unwrap();
    let mut relu = Relu::new(&Device::Cpu, shape).unwrap();
    let x = pushed(&[4], vec![0.0; 4]);
    assert!(matches!(relu.forward(&x, false), Err(Error::BatchMismatch { .. })));
}
