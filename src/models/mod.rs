pub mod syncing_file;
