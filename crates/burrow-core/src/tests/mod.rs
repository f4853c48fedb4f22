mod helpers;

mod attrib;
