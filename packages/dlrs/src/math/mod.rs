pub mod rate_density;
