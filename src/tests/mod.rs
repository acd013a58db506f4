pub mod helpers;
mod invalidation;
