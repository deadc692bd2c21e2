use flatfs::{EntryKind, FileBlockEmulatorBuilder, FileSystem};

pub fn main() {
    let tmp = tempfile::tempfile().unwrap();
    let dev = FileBlockEmulatorBuilder::from(tmp)
        .build()
        .expect("Could not initialize disk emulator.");

    // 2000 sectors of 512 bytes, 250 blocks of 4K.
    let mut fs = FileSystem::format(dev, 2000).expect("should format");
    fs.create("hello.txt", 0, EntryKind::File).unwrap();
    fs.write("hello.txt", 0, b"hello, world").unwrap();

    let content = fs.read("hello.txt", 0, 12).unwrap();
    println!("{}", String::from_utf8_lossy(&content));
    for entry in fs.list().unwrap() {
        println!("{:<20} {:>10} {:>6}", entry.name, entry.size, entry.start_block);
    }
}
