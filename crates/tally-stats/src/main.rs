fn main() {
    tally_stats::runtime::app::run_from_args();
}
