pub mod vastup_core;
