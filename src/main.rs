fn main() {
    k2gate::run();
}
