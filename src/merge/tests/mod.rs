mod tests_resolution;
mod tests_versions;
