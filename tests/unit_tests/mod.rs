use matfree::{Backend, Registry};

mod elem_restriction;
mod operator;
mod qfunction;
mod vector;

/// Resources of all builtin backends.
pub const RESOURCES: [&str; 5] = [
    "/cpu/self/ref/serial",
    "/cpu/self/ref/blocked",
    "/cpu/self/opt/serial",
    "/cpu/self/opt/blocked",
    "/gpu/sim/ref",
];

pub fn backend(resource: &str) -> Backend {
    Registry::builtin()
        .resolve(resource)
        .expect("Builtin resources must resolve")
}

pub fn dot(x: &[f64], y: &[f64]) -> f64 {
    x.iter().zip(y).map(|(x, y)| x * y).sum()
}
