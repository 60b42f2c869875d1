pub mod conv2d;
pub mod dropout;
pub mod fully_connected;
pub mod max_pool;
pub mod relu;
pub mod softmax;
pub mod sum_of_squares;

pub use conv2d::Conv2d;
pub use dropout::Dropout;
pub use fully_connected::FullyConnected;
pub use max_pool::MaxPool;
pub use relu::Relu;
pub use softmax::Softmax;
pub use sum_of_squares::SumOfSquares;
