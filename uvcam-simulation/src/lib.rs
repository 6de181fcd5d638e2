//! 仿真 UVC 设备
//!
//! 在进程内模拟 USB 总线上的 UVC 摄像头：热插拔、格式描述符、控件范围、
//! 合成帧、故障与延迟注入，以及检测硬件调用重入的探针。
//! `uvcam` 的集成测试和示例都跑在这里之上。

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod camera;
pub mod driver;
pub mod probe;
pub mod stream;

pub use camera::{SimCamera, SimCameraBuilder};
pub use driver::SimDriver;
pub use probe::ReentrancyProbe;
