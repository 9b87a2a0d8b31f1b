mod helpers;
mod tests_split;
mod tests_write_scan;
