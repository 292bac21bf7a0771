pub mod psort;
